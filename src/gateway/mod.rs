//! Exchange gateway boundary
//!
//! The engine consumes one capability trait plus a handful of normalized
//! records; everything venue-specific (signing, wire shapes, reconnects)
//! stays behind it. A mock implementation lives alongside for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::GridResult;
use crate::indicators::Candle;

pub mod mock;
pub mod standx;

pub use standx::StandXGateway;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Whether this side rests on the ask book
    pub fn is_ask(self) -> bool {
        matches!(self, Side::Sell)
    }

    pub fn from_is_ask(is_ask: bool) -> Self {
        if is_ask {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl From<&str> for Side {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "b" | "buy" | "bid" => Side::Buy,
            _ => Side::Sell,
        }
    }
}

/// Closed set of order states the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Filled,
    Canceled,
    Expired,
    Rejected,
    Unknown,
}

impl OrderStatus {
    /// Map a venue status string onto the closed enum.
    pub fn from_wire(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "new" | "open" | "partially_filled" => OrderStatus::Open,
            "closed" => OrderStatus::Closed,
            "filled" => OrderStatus::Filled,
            "canceled" | "cancelled" => OrderStatus::Canceled,
            "expired" => OrderStatus::Expired,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Unknown,
        }
    }

    /// Terminal states that carry a fill
    pub fn is_done(self) -> bool {
        matches!(self, OrderStatus::Closed | OrderStatus::Filled)
    }
}

/// Normalized resting/updated order
#[derive(Debug, Clone)]
pub struct Order {
    /// Exchange-assigned id (may be empty on some update paths)
    pub id: String,
    /// Client order id; the engine keys its books on this when present
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub status: OrderStatus,
}

impl Order {
    /// The id the engine tracks this order under.
    pub fn key(&self) -> &str {
        if self.client_order_id.is_empty() {
            &self.id
        } else {
            &self.client_order_id
        }
    }
}

/// Normalized position snapshot
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    /// Absolute open quantity
    pub qty: Decimal,
    /// -1 short, 0 flat, 1 long
    pub sign: i8,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Normalized account trade
#[derive(Debug, Clone)]
pub struct Trade {
    /// Venue trade id when reported
    pub trade_id: Option<String>,
    /// Order the trade executed against (exchange or client id)
    pub order_ref: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    /// Epoch milliseconds
    pub ts: i64,
}

/// Account snapshot
#[derive(Debug, Clone, Default)]
pub struct AccountInfo {
    pub total_equity: Decimal,
    pub positions: HashMap<String, Position>,
}

impl AccountInfo {
    /// First reported position, the single-symbol case.
    pub fn primary_position(&self) -> Option<&Position> {
        self.positions.values().next()
    }
}

/// One order to place
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderSpec {
    pub is_ask: bool,
    pub price: Decimal,
    pub size: Decimal,
}

impl OrderSpec {
    pub fn new(is_ask: bool, price: Decimal, size: Decimal) -> Self {
        Self { is_ask, price, size }
    }
}

/// Typed events the stream layer pushes at the engine
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Mark-price update
    Price(Decimal),
    /// Own-order status changes
    Orders(Vec<Order>),
    /// Own-position updates
    Positions(Vec<Position>),
}

pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<GatewayEvent>;

/// Exchange operations the engine consumes - can be mocked for testing
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Verify connectivity and auth material; fatal on failure
    async fn initialize(&self) -> GridResult<()>;

    /// Start the streaming layer, feeding `events` until `close`
    async fn subscribe(&self, events: EventSender) -> GridResult<()>;

    /// Authoritative open-order list
    async fn get_orders_by_rest(&self) -> GridResult<Vec<Order>>;

    /// Recent account trades; `side_filter`: 0 = all, 1 = buys, 2 = sells
    async fn get_trades_by_rest(&self, side_filter: u8, limit: usize) -> GridResult<Vec<Trade>>;

    /// Equity plus position snapshot
    async fn get_account_info(&self) -> GridResult<AccountInfo>;

    /// Place one resting limit order; returns the tracking id
    async fn place_single_order(
        &self,
        is_ask: bool,
        price: Decimal,
        size: Decimal,
        client_id: Option<String>,
    ) -> GridResult<String>;

    /// Place one market order; returns the tracking id
    async fn place_single_market_order(&self, is_ask: bool, size: Decimal) -> GridResult<String>;

    /// Place a batch; on partial failure the gateway cancels what it placed
    /// and errors, so the engine never sees a half-applied batch
    async fn place_multi_orders(&self, orders: &[OrderSpec]) -> GridResult<Vec<String>>;

    /// Cancel and verify absence from the open-order list; `Ok(false)` means
    /// the cancel was accepted but could not be verified yet
    async fn cancel_grid_orders(&self, order_ids: &[String]) -> GridResult<bool>;

    /// Re-price/re-size an order; fails when the original side is unknown
    async fn modify_grid_order(
        &self,
        order_id: &str,
        price: Decimal,
        size: Decimal,
    ) -> GridResult<bool>;

    /// OHLCV history, oldest first
    async fn candle_stick(
        &self,
        market_id: u32,
        resolution: &str,
        count_back: usize,
    ) -> GridResult<Vec<Candle>>;

    /// Tear down streams and connections
    async fn close(&self) -> GridResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_from_wire() {
        assert_eq!(Side::from("buy"), Side::Buy);
        assert_eq!(Side::from("B"), Side::Buy);
        assert_eq!(Side::from("sell"), Side::Sell);
        assert_eq!(Side::from("ask"), Side::Sell);
    }

    #[test]
    fn test_status_from_wire() {
        assert_eq!(OrderStatus::from_wire("new"), OrderStatus::Open);
        assert_eq!(OrderStatus::from_wire("FILLED"), OrderStatus::Filled);
        assert_eq!(OrderStatus::from_wire("cancelled"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::from_wire("gibberish"), OrderStatus::Unknown);
        assert!(OrderStatus::from_wire("closed").is_done());
        assert!(!OrderStatus::from_wire("open").is_done());
    }

    #[test]
    fn test_order_key_prefers_client_id() {
        let order = Order {
            id: "12345".into(),
            client_order_id: "grid_1".into(),
            side: Side::Buy,
            price: dec!(3000),
            size: dec!(0.01),
            filled_size: Decimal::ZERO,
            status: OrderStatus::Open,
        };
        assert_eq!(order.key(), "grid_1");

        let bare = Order {
            client_order_id: String::new(),
            ..order
        };
        assert_eq!(bare.key(), "12345");
    }
}
