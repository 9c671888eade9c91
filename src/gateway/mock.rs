//! In-memory gateway for engine tests
//!
//! Keeps an actual open-order book so reconcile round-trips can be exercised
//! without a venue: placements append, cancels remove, and
//! `get_orders_by_rest` returns the live book.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::{
    AccountInfo, EventSender, ExchangeGateway, Order, OrderSpec, OrderStatus, Side, Trade,
};
use crate::errors::{GridError, GridResult};
use crate::indicators::Candle;

/// Mock gateway for testing
pub struct MockGateway {
    pub open_orders: Arc<Mutex<Vec<Order>>>,
    pub cancelled: Arc<Mutex<Vec<String>>>,
    pub market_orders: Arc<Mutex<Vec<(bool, Decimal)>>>,
    pub trades: Arc<Mutex<Vec<Trade>>>,
    pub account: Arc<Mutex<AccountInfo>>,
    pub candles: Arc<Mutex<HashMap<String, Vec<Candle>>>>,
    pub should_fail: Arc<Mutex<bool>>,
    /// Fail the Nth order of the next multi placement (0-based)
    pub fail_multi_at: Arc<Mutex<Option<usize>>>,
    next_id: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            open_orders: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
            market_orders: Arc::new(Mutex::new(Vec::new())),
            trades: Arc::new(Mutex::new(Vec::new())),
            account: Arc::new(Mutex::new(AccountInfo::default())),
            candles: Arc::new(Mutex::new(HashMap::new())),
            should_fail: Arc::new(Mutex::new(false)),
            fail_multi_at: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn set_should_fail(&self, fail: bool) {
        *self.should_fail.lock().await = fail;
    }

    pub async fn set_candles(&self, resolution: &str, candles: Vec<Candle>) {
        self.candles
            .lock()
            .await
            .insert(resolution.to_string(), candles);
    }

    pub async fn set_equity(&self, equity: Decimal) {
        self.account.lock().await.total_equity = equity;
    }

    pub async fn push_open_order(&self, order: Order) {
        self.open_orders.lock().await.push(order);
    }

    pub async fn open_order_count(&self) -> usize {
        self.open_orders.lock().await.len()
    }

    fn next_client_id(&self) -> String {
        format!("mock_{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn insert_order(&self, spec: &OrderSpec, client_id: Option<String>) -> String {
        let cl_ord_id = client_id.unwrap_or_else(|| self.next_client_id());
        let order = Order {
            id: format!("{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            client_order_id: cl_ord_id.clone(),
            side: Side::from_is_ask(spec.is_ask),
            price: spec.price,
            size: spec.size,
            filled_size: Decimal::ZERO,
            status: OrderStatus::Open,
        };
        self.open_orders.lock().await.push(order);
        cl_ord_id
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn initialize(&self) -> GridResult<()> {
        Ok(())
    }

    async fn subscribe(&self, _events: EventSender) -> GridResult<()> {
        Ok(())
    }

    async fn get_orders_by_rest(&self) -> GridResult<Vec<Order>> {
        if *self.should_fail.lock().await {
            return Err(GridError::Gateway("mock failure".into()));
        }
        Ok(self.open_orders.lock().await.clone())
    }

    async fn get_trades_by_rest(&self, side_filter: u8, limit: usize) -> GridResult<Vec<Trade>> {
        let trades = self.trades.lock().await;
        let filtered: Vec<Trade> = trades
            .iter()
            .filter(|t| match side_filter {
                1 => t.side == Side::Buy,
                2 => t.side == Side::Sell,
                _ => true,
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(filtered)
    }

    async fn get_account_info(&self) -> GridResult<AccountInfo> {
        Ok(self.account.lock().await.clone())
    }

    async fn place_single_order(
        &self,
        is_ask: bool,
        price: Decimal,
        size: Decimal,
        client_id: Option<String>,
    ) -> GridResult<String> {
        if *self.should_fail.lock().await {
            return Err(GridError::Gateway("mock failure".into()));
        }
        Ok(self
            .insert_order(&OrderSpec::new(is_ask, price, size), client_id)
            .await)
    }

    async fn place_single_market_order(&self, is_ask: bool, size: Decimal) -> GridResult<String> {
        if *self.should_fail.lock().await {
            return Err(GridError::Gateway("mock failure".into()));
        }
        self.market_orders.lock().await.push((is_ask, size));
        Ok(self.next_client_id())
    }

    async fn place_multi_orders(&self, orders: &[OrderSpec]) -> GridResult<Vec<String>> {
        if *self.should_fail.lock().await {
            return Err(GridError::Gateway("mock failure".into()));
        }
        let fail_at = self.fail_multi_at.lock().await.take();
        let mut ids = Vec::with_capacity(orders.len());
        for (i, spec) in orders.iter().enumerate() {
            if fail_at == Some(i) {
                // Roll back what went in, like the real gateway.
                let placed = ids.clone();
                self.cancel_grid_orders(&placed).await?;
                return Err(GridError::PartialPlacement {
                    placed: i,
                    requested: orders.len(),
                });
            }
            ids.push(self.insert_order(spec, None).await);
        }
        Ok(ids)
    }

    async fn cancel_grid_orders(&self, order_ids: &[String]) -> GridResult<bool> {
        let mut open = self.open_orders.lock().await;
        open.retain(|o| {
            let gone = order_ids.iter().any(|id| id == o.key() || *id == o.id);
            !gone
        });
        self.cancelled.lock().await.extend_from_slice(order_ids);
        Ok(true)
    }

    async fn modify_grid_order(
        &self,
        order_id: &str,
        price: Decimal,
        size: Decimal,
    ) -> GridResult<bool> {
        let mut open = self.open_orders.lock().await;
        for order in open.iter_mut() {
            if order.key() == order_id || order.id == order_id {
                order.price = price;
                order.size = size;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn candle_stick(
        &self,
        _market_id: u32,
        resolution: &str,
        _count_back: usize,
    ) -> GridResult<Vec<Candle>> {
        Ok(self
            .candles
            .lock()
            .await
            .get(resolution)
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&self) -> GridResult<()> {
        Ok(())
    }
}
