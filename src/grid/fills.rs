//! Fill attribution
//!
//! Two ingestion paths share one attribution core: streamed own-order
//! updates, and the periodic REST trade sweep that catches fills the stream
//! dropped. Both run under the engine's replenish lock.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::state::GridState;
use crate::config::GridSettings;
use crate::gateway::{Order, Side, Trade};
use crate::quantize::round_dp;

/// Decimal places in the trade fingerprint
const FINGERPRINT_SCALE: u32 = 8;

/// Oversize factor past which a REST trade cannot be a grid fill
fn trade_size_limit(grid_amount: Decimal) -> Decimal {
    grid_amount * dec!(1.5)
}

/// What a processed fill did to the state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillOutcome {
    /// A resting order was actually removed; replenish should run
    pub removed: bool,
    pub is_close_side: bool,
    pub trade_price: Decimal,
}

/// Tolerance for attributing a fill to a resting price when the id is
/// unknown.
fn price_tolerance(base_step: Decimal) -> Decimal {
    let floor = dec!(0.6);
    (base_step * dec!(0.6)).max(floor)
}

/// Shared attribution core: remove the filled order, adjust inventory and
/// profit counters, flag whether replenishment is owed.
fn attribute(
    state: &mut GridState,
    cfg: &GridSettings,
    key: &str,
    side: Side,
    price: Decimal,
) -> FillOutcome {
    let is_ask = side.is_ask();
    let is_close_side = is_ask == state.direction.close_is_ask();

    state.filled_count += 1;
    state.last_trade_price = price;
    state.recent_filled_ids.insert(key);

    let mut removed = state.remove_order(key, is_ask).is_some();
    if !removed {
        // Unknown id: the order predates this session or was re-keyed by the
        // venue. Fall back to the nearest resting price.
        let tolerance = price_tolerance(state.base_step);
        removed = state
            .remove_nearest_at_price(is_ask, price, tolerance)
            .is_some();
    }

    state.last_fill_was_close_side = is_close_side;

    if is_close_side && removed {
        // Position updates lag the fill stream; debit inventory now and let
        // the next snapshot reconcile the difference.
        state.available_position =
            (state.available_position - cfg.grid_amount).max(Decimal::ZERO);

        let once_profit = state.base_step * cfg.grid_amount;
        state.active_profit += once_profit;
        state.total_profit += once_profit;
        state.available_reduce_profit += once_profit;
    }

    FillOutcome {
        removed,
        is_close_side,
        trade_price: price,
    }
}

/// Process one streamed own-order update. Returns an outcome only for a fill
/// that warrants a replenish pass.
pub fn apply_order_update(
    state: &mut GridState,
    cfg: &GridSettings,
    order: &Order,
) -> Option<FillOutcome> {
    // Oversized rows and known placeholders are parked inventory, not rungs.
    if order.size > cfg.grid_amount {
        return None;
    }
    let key = order.key().to_string();
    if key.is_empty() || state.placeholder_orders.contains_key(&key) {
        return None;
    }

    if order.status == crate::gateway::OrderStatus::Open {
        state.insert_order(key, order.side.is_ask(), order.price);
        return None;
    }

    if order.status.is_done() && order.filled_size > Decimal::ZERO {
        let outcome = attribute(state, cfg, &key, order.side, order.price);
        return outcome.removed.then_some(outcome);
    }

    None
}

/// Dedup key for a REST-reported trade.
pub fn trade_key(trade: &Trade) -> String {
    if let Some(id) = &trade.trade_id {
        if !id.is_empty() {
            return id.clone();
        }
    }
    format!(
        "{}:{}:{}:{}:{}",
        trade.order_ref,
        trade.side.as_str(),
        round_dp(trade.price, FINGERPRINT_SCALE),
        round_dp(trade.size, FINGERPRINT_SCALE),
        trade.ts
    )
}

/// Process one REST-reconciled trade; `None` when deduplicated or non-grid.
pub fn apply_trade(
    state: &mut GridState,
    cfg: &GridSettings,
    trade: &Trade,
) -> Option<FillOutcome> {
    if trade.size > trade_size_limit(cfg.grid_amount) {
        return None;
    }
    let key = trade_key(trade);
    if state.processed_trade_keys.contains(&key) {
        return None;
    }
    if state.recent_filled_ids.contains(&trade.order_ref) {
        // The streamed path already handled this fill.
        state.processed_trade_keys.insert(key);
        return None;
    }
    state.processed_trade_keys.insert(key);

    let outcome = attribute(state, cfg, &trade.order_ref, trade.side, trade.price);
    outcome.removed.then_some(outcome)
}
