//! Grid market-maker binary
//!
//! ## Setup
//!
//! 1. Create a `.env` file in the project root:
//!    ```
//!    STANDX_API_TOKEN=your-api-token
//!    STANDX_REQUEST_SIGN_PRIVATE_KEY=hex-or-base64-ed25519-key
//!    ```
//!
//! 2. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- --config grid.toml
//!    ```
//!
//! Strategy settings come from the TOML file (or `APP__`-prefixed environment
//! variables); secrets stay in `.env`, which must never be committed.

use std::env;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::watch;

use standx_grid::config::Settings;
use standx_grid::gateway::{ExchangeGateway, StandXGateway};
use standx_grid::grid::GridRunner;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match dotenvy::dotenv() {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(_) => info!("No .env file found, using process environment"),
    }

    let args: Vec<String> = env::args().collect();
    let config_path = match args.get(1).map(String::as_str) {
        Some("--config") => args.get(2).map(String::as_str),
        _ => None,
    };

    let settings = match Settings::load(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return;
        }
    };

    info!(
        "Starting {:?} grid on {}: {} rungs of {} at {}% spread",
        settings.grid.direction,
        settings.gateway.symbol,
        settings.grid.grid_count,
        settings.grid.grid_amount,
        settings.grid.grid_spread,
    );

    let gateway = match StandXGateway::new(settings.gateway.clone()) {
        Ok(gateway) => Arc::new(gateway) as Arc<dyn ExchangeGateway>,
        Err(e) => {
            error!("Failed to build gateway: {e}");
            return;
        }
    };

    let runner = GridRunner::new(&settings, gateway);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stop signal received");
            let _ = stop_tx.send(true);
        }
    });

    match runner.run(stop_rx).await {
        Ok(()) => info!("Grid bot stopped cleanly"),
        Err(e) => error!("Grid bot error: {e}"),
    }
}
