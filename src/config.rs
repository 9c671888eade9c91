//! Runtime configuration
//!
//! Settings come from an optional TOML file overlaid with `APP`-prefixed
//! environment variables (`APP__GRID__GRID_COUNT=12`). Secrets (API token,
//! request-signing key, proxy) are read from the plain environment so they can
//! live in a `.env` file that never enters version control.

use std::env;
use std::path::PathBuf;

use config::{Config, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::errors::{GridError, GridResult};
use crate::grid::Direction;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Grid strategy parameters
    pub grid: GridSettings,
    /// Exchange gateway parameters
    #[serde(default)]
    pub gateway: GatewaySettings,
    /// Optional webhook notifier
    #[serde(default)]
    pub notify: NotifySettings,
}

/// Grid strategy parameters
#[derive(Debug, Clone, Deserialize)]
pub struct GridSettings {
    /// Strategy direction; flips open/close side semantics everywhere
    #[serde(default)]
    pub direction: Direction,

    /// Target rungs per side
    pub grid_count: usize,

    /// Per-rung order size
    pub grid_amount: Decimal,

    /// Initial ladder spacing, percent of the base price
    pub grid_spread: Decimal,

    /// Hard cap on close-side grid population
    pub max_total_orders: usize,

    /// Absolute inventory cap; crossing it pauses the grid
    pub max_position: Decimal,

    /// Inventory level that widens the open-side ladder
    pub alert_position: Decimal,

    /// Inventory level that arms reduce mode
    pub decrease_position: Decimal,

    /// Whether reduce mode may actually trade
    #[serde(default)]
    pub reduce_mode: bool,

    /// 1-minute ATR above which the step scales with volatility
    #[serde(default = "default_atr_threshold")]
    pub atr_threshold: f64,

    /// Single-candle adverse move treated as a rapid market move
    #[serde(default = "default_rapid_move_threshold")]
    pub rapid_move_threshold: f64,

    /// Venue market id, passed through to the gateway
    #[serde(default)]
    pub market_id: u32,

    /// Tick the engine quantizes ladder prices to
    #[serde(default = "default_price_tick")]
    pub price_tick: Decimal,

    /// Optional append-only realized-profit log (JSON lines)
    #[serde(default)]
    pub profit_log: Option<PathBuf>,
}

fn default_atr_threshold() -> f64 {
    7.0
}

fn default_rapid_move_threshold() -> f64 {
    15.0
}

fn default_price_tick() -> Decimal {
    dec!(0.01)
}

impl GridSettings {
    /// Create settings with required parameters and conservative defaults.
    pub fn new(
        direction: Direction,
        grid_count: usize,
        grid_amount: Decimal,
        grid_spread: Decimal,
    ) -> Self {
        Self {
            direction,
            grid_count,
            grid_amount,
            grid_spread,
            max_total_orders: grid_count * 2,
            max_position: grid_amount * Decimal::from(grid_count as u64 * 4),
            alert_position: grid_amount * Decimal::from(grid_count as u64 * 2),
            decrease_position: grid_amount * Decimal::from(grid_count as u64 * 3),
            reduce_mode: false,
            atr_threshold: default_atr_threshold(),
            rapid_move_threshold: default_rapid_move_threshold(),
            market_id: 0,
            price_tick: default_price_tick(),
            profit_log: None,
        }
    }

    /// Builder: set the inventory limits in one call
    pub fn with_position_limits(
        mut self,
        alert: Decimal,
        decrease: Decimal,
        max: Decimal,
    ) -> Self {
        self.alert_position = alert;
        self.decrease_position = decrease;
        self.max_position = max;
        self
    }

    /// Builder: set the close-side order cap
    pub fn with_max_total_orders(mut self, cap: usize) -> Self {
        self.max_total_orders = cap;
        self
    }

    /// Builder: enable reduce mode
    pub fn with_reduce_mode(mut self, enabled: bool) -> Self {
        self.reduce_mode = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.grid_count == 0 {
            return Err(GridError::Config("grid_count must be at least 1".into()));
        }
        if self.grid_amount <= Decimal::ZERO {
            return Err(GridError::Config("grid_amount must be positive".into()));
        }
        if self.grid_spread <= Decimal::ZERO {
            return Err(GridError::Config("grid_spread must be positive".into()));
        }
        if self.max_total_orders == 0 {
            return Err(GridError::Config(
                "max_total_orders must be at least 1".into(),
            ));
        }
        if self.max_position <= Decimal::ZERO {
            return Err(GridError::Config("max_position must be positive".into()));
        }
        if self.price_tick <= Decimal::ZERO {
            return Err(GridError::Config("price_tick must be positive".into()));
        }
        Ok(())
    }
}

/// Exchange gateway parameters
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Bearer token; usually supplied via STANDX_API_TOKEN
    #[serde(default)]
    pub api_token: String,

    /// Ed25519 request-signing key (raw hex or base64); usually supplied via
    /// STANDX_REQUEST_SIGN_PRIVATE_KEY
    #[serde(default)]
    pub signing_key: String,

    /// Venue price tick the wire formatter starts from
    #[serde(default = "default_gateway_tick")]
    pub price_tick: Decimal,

    /// Venue quantity step
    #[serde(default = "default_qty_step")]
    pub qty_step: Decimal,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: f64,

    #[serde(default)]
    pub proxy_url: Option<String>,
}

fn default_base_url() -> String {
    "https://perps.standx.com".to_string()
}

fn default_ws_url() -> String {
    "wss://perps.standx.com/ws-stream/v1".to_string()
}

fn default_symbol() -> String {
    "ETH-USD".to_string()
}

fn default_gateway_tick() -> Decimal {
    dec!(0.1)
}

fn default_qty_step() -> Decimal {
    dec!(0.001)
}

fn default_http_timeout() -> f64 {
    8.0
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            symbol: default_symbol(),
            api_token: String::new(),
            signing_key: String::new(),
            price_tick: default_gateway_tick(),
            qty_step: default_qty_step(),
            http_timeout_secs: default_http_timeout(),
            proxy_url: None,
        }
    }
}

/// Optional webhook notifier parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifySettings {
    pub webhook_url: Option<String>,
    pub keyword: Option<String>,
}

impl Settings {
    /// Load settings from an optional file plus the environment.
    pub fn load(config_path: Option<&str>) -> GridResult<Self> {
        let mut builder = Config::builder();
        builder = match config_path {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("grid").required(false)),
        };
        builder = builder.add_source(Environment::with_prefix("APP").separator("__"));

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if settings.gateway.api_token.is_empty() {
            if let Ok(token) = env::var("STANDX_API_TOKEN") {
                settings.gateway.api_token = token.trim().to_string();
            }
        }
        if settings.gateway.signing_key.is_empty() {
            if let Ok(key) = env::var("STANDX_REQUEST_SIGN_PRIVATE_KEY") {
                settings.gateway.signing_key = key.trim().to_string();
            }
        }
        if settings.gateway.proxy_url.is_none() {
            if let Ok(proxy) = env::var("PROXY_URL") {
                if !proxy.trim().is_empty() {
                    settings.gateway.proxy_url = Some(proxy.trim().to_string());
                }
            }
        }

        settings.grid.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = GridSettings::new(Direction::Long, 10, dec!(0.01), dec!(0.05));
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_total_orders, 20);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let settings = GridSettings::new(Direction::Long, 0, dec!(0.01), dec!(0.05));
        assert!(settings.validate().is_err());

        let settings = GridSettings::new(Direction::Long, 10, Decimal::ZERO, dec!(0.05));
        assert!(settings.validate().is_err());

        let settings = GridSettings::new(Direction::Long, 10, dec!(0.01), dec!(-1));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_direction_wire_names() {
        let long: Direction = serde_json::from_str("\"LONG\"").unwrap();
        assert_eq!(long, Direction::Long);
        let short: Direction = serde_json::from_str("\"SHORT\"").unwrap();
        assert_eq!(short, Direction::Short);
        assert!(serde_json::from_str::<Direction>("\"SIDEWAYS\"").is_err());
    }
}
