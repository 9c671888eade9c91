//! Broker-truth reconciliation
//!
//! `rebuild` maps an authoritative open-order snapshot into the engine's
//! book shape; the `plan_*` functions are pure pruning passes that return
//! cancel lists for the engine to execute. Keeping both sides pure lets the
//! whole reconcile pipeline run in tests without a gateway.

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::state::{Direction, GridState, PlaceholderOrder};
use crate::config::GridSettings;
use crate::gateway::{Order, OrderStatus};
use crate::quantize::round_dp;

/// Decimal places two grid prices may share before one is a duplicate
const DUPLICATE_SCALE: u32 = 1;

/// Book rebuilt from a broker snapshot
#[derive(Debug, Default)]
pub struct ReconciledBook {
    pub buys: BTreeMap<String, Decimal>,
    pub sells: BTreeMap<String, Decimal>,
    pub placeholders: BTreeMap<String, PlaceholderOrder>,
}

/// Classify an open-order snapshot into grid orders and placeholders.
///
/// Only `Open` rows survive. A close-side row larger than `grid_amount` is a
/// parked-inventory placeholder, never a grid rung.
pub fn rebuild(snapshot: &[Order], direction: Direction, grid_amount: Decimal) -> ReconciledBook {
    let mut book = ReconciledBook::default();
    for order in snapshot {
        if order.status != OrderStatus::Open {
            continue;
        }
        let key = order.key().to_string();
        if key.is_empty() {
            continue;
        }
        let is_close_side = order.side.is_ask() == direction.close_is_ask();
        if is_close_side && order.size > grid_amount {
            book.placeholders.insert(
                key,
                PlaceholderOrder {
                    price: order.price,
                    size: order.size,
                },
            );
            continue;
        }
        if order.side.is_ask() {
            book.sells.insert(key, order.price);
        } else {
            book.buys.insert(key, order.price);
        }
    }
    book
}

/// Apply a rebuilt book to the state, dropping any local entry the broker no
/// longer reports.
pub fn apply(state: &mut GridState, book: ReconciledBook) {
    state.buy_orders = book.buys;
    state.sell_orders = book.sells;
    state.set_placeholders(book.placeholders);
    state.recompute_available();
}

/// Entries of one side ordered furthest-from-spot first.
fn furthest_first(orders: &BTreeMap<String, Decimal>, ascending: bool) -> Vec<(String, Decimal)> {
    let mut entries: Vec<(String, Decimal)> =
        orders.iter().map(|(id, p)| (id.clone(), *p)).collect();
    entries.sort_by(|a, b| {
        let ord = a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0));
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    entries
}

/// Open-side overflow: anything past `GRID_COUNT + 1` rungs goes, furthest
/// first (lowest buys for Long, highest sells for Short).
pub fn plan_open_overflow(state: &GridState, cfg: &GridSettings) -> Vec<String> {
    let open = state.open_orders();
    let cap = cfg.grid_count + 1;
    if open.len() <= cap {
        return Vec::new();
    }
    let excess = open.len() - cap;
    furthest_first(open, !state.direction.open_is_ask())
        .into_iter()
        .take(excess)
        .map(|(id, _)| id)
        .collect()
}

/// Close-side overflow: prune below `MAX_TOTAL_ORDERS` with a little headroom
/// so the next replenish does not immediately re-trip the cap.
pub fn plan_close_overflow(state: &GridState, cfg: &GridSettings) -> Vec<String> {
    let close = state.close_orders();
    if close.len() <= cfg.max_total_orders {
        return Vec::new();
    }
    let excess = close.len() - cfg.max_total_orders + 2;
    furthest_first(close, !state.direction.close_is_ask())
        .into_iter()
        .take(excess)
        .map(|(id, _)| id)
        .collect()
}

/// Inventory overflow: the close-side grid may not promise more inventory
/// than is available. Placeholders are not grid rungs and are never touched.
pub fn plan_inventory_overflow(state: &GridState, cfg: &GridSettings) -> Vec<String> {
    let close = state.close_orders();
    let promised = Decimal::from(close.len() as u64) * cfg.grid_amount;
    if promised <= state.available_position {
        return Vec::new();
    }
    let supported = (state.available_position / cfg.grid_amount)
        .floor()
        .to_usize()
        .unwrap_or(0);
    if close.len() <= supported {
        return Vec::new();
    }
    let excess = close.len() - supported;
    furthest_first(close, !state.direction.close_is_ask())
        .into_iter()
        .take(excess)
        .map(|(id, _)| id)
        .collect()
}

/// Pause cleanup: every grid order on both sides; placeholders stay resting.
pub fn plan_pause_cleanup(state: &GridState) -> Vec<String> {
    if !state.grid_paused {
        return Vec::new();
    }
    state
        .buy_orders
        .keys()
        .chain(state.sell_orders.keys())
        .cloned()
        .collect()
}

/// Duplicate prices on one side: the lowest id at a rounded price survives.
fn duplicates_of(orders: &BTreeMap<String, Decimal>) -> Vec<String> {
    let mut entries: Vec<(String, Decimal)> =
        orders.iter().map(|(id, p)| (id.clone(), *p)).collect();
    entries.sort_by(|a, b| {
        round_dp(a.1, DUPLICATE_SCALE)
            .cmp(&round_dp(b.1, DUPLICATE_SCALE))
            .then_with(|| a.0.cmp(&b.0))
    });
    let mut cancels = Vec::new();
    let mut prev: Option<Decimal> = None;
    for (id, price) in entries {
        let rounded = round_dp(price, DUPLICATE_SCALE);
        if prev == Some(rounded) {
            cancels.push(id);
        } else {
            prev = Some(rounded);
        }
    }
    cancels
}

/// Duplicate-price pruning across both sides.
pub fn plan_duplicates(state: &GridState) -> Vec<String> {
    let mut cancels = duplicates_of(&state.buy_orders);
    cancels.extend(duplicates_of(&state.sell_orders));
    cancels
}
