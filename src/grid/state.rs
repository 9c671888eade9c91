//! Authoritative in-memory grid state
//!
//! One owned value, mutated only by engine methods running under the
//! replenish lock. Side maps are keyed by order id; the open/close views are
//! derived from the configured direction.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Strategy direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    Long,
    Short,
}

impl Direction {
    /// The side that adds inventory rests on the ask book for Short.
    pub fn open_is_ask(self) -> bool {
        matches!(self, Direction::Short)
    }

    /// The profit-taking side rests on the ask book for Long.
    pub fn close_is_ask(self) -> bool {
        matches!(self, Direction::Long)
    }

    /// +1 when close-side prices sit above spot (Long), -1 below (Short).
    pub fn profit_sign(self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

/// A resting close-side order parking inventory during a pause
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaceholderOrder {
    pub price: Decimal,
    pub size: Decimal,
}

/// Insertion-ordered set with a hard size cap; oldest entries fall out first.
#[derive(Debug, Default)]
pub struct BoundedSet {
    cap: usize,
    queue: VecDeque<String>,
    set: HashSet<String>,
}

impl BoundedSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            queue: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    /// Insert a key, trimming the oldest entries past the cap. Returns false
    /// when the key was already present.
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.queue.push_back(key);
        while self.queue.len() > self.cap {
            if let Some(old) = self.queue.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Cap for the fill/trade dedup caches
pub const DEDUP_CACHE_CAP: usize = 5000;

/// How long the close-side inventory check waits after startup before pruning
pub const STARTUP_GRACE: Duration = Duration::from_secs(60);

/// Authoritative engine state
#[derive(Debug)]
pub struct GridState {
    pub direction: Direction,

    /// Resting buy grid orders, id -> price
    pub buy_orders: BTreeMap<String, Decimal>,
    /// Resting sell grid orders, id -> price
    pub sell_orders: BTreeMap<String, Decimal>,
    /// Parked-inventory orders, id -> (price, size)
    pub placeholder_orders: BTreeMap<String, PlaceholderOrder>,
    /// Derived index: placeholder price -> size
    pub placeholder_positions: BTreeMap<Decimal, Decimal>,

    pub current_price: Option<Decimal>,
    pub last_trade_price: Decimal,

    /// Absolute open inventory
    pub position_abs: Decimal,
    /// Inventory not reserved by pending-release placeholders
    pub available_position: Decimal,

    /// Rung distance fixed at startup
    pub base_step: Decimal,
    /// Working rung distance, widened under volatility or alert
    pub active_step: Decimal,

    pub start_equity: Decimal,
    pub current_equity: Decimal,

    pub total_profit: Decimal,
    pub active_profit: Decimal,
    pub available_reduce_profit: Decimal,

    pub filled_count: u64,
    pub start_time: Instant,
    pub last_replenish_time: Option<Instant>,

    pub grid_paused: bool,
    pub open_spread_alert: bool,
    pub decrease_mode: bool,
    pub placeholder_exists: bool,
    pub placing_placeholder: bool,

    /// Startup behaves as if the last event were a profit-taking fill.
    pub last_fill_was_close_side: bool,

    pub processed_trade_keys: BoundedSet,
    pub recent_filled_ids: BoundedSet,
    /// First trade-reconciliation pass only seeds the dedup baseline
    pub trade_baseline_seeded: bool,
}

impl GridState {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            buy_orders: BTreeMap::new(),
            sell_orders: BTreeMap::new(),
            placeholder_orders: BTreeMap::new(),
            placeholder_positions: BTreeMap::new(),
            current_price: None,
            last_trade_price: Decimal::ZERO,
            position_abs: Decimal::ZERO,
            available_position: Decimal::ZERO,
            base_step: Decimal::ZERO,
            active_step: Decimal::ZERO,
            start_equity: Decimal::ZERO,
            current_equity: Decimal::ZERO,
            total_profit: Decimal::ZERO,
            active_profit: Decimal::ZERO,
            available_reduce_profit: Decimal::ZERO,
            filled_count: 0,
            start_time: Instant::now(),
            last_replenish_time: None,
            grid_paused: false,
            open_spread_alert: false,
            decrease_mode: false,
            placeholder_exists: false,
            placing_placeholder: false,
            last_fill_was_close_side: true,
            processed_trade_keys: BoundedSet::new(DEDUP_CACHE_CAP),
            recent_filled_ids: BoundedSet::new(DEDUP_CACHE_CAP),
            trade_baseline_seeded: false,
        }
    }

    /// Orders on the side that adds inventory
    pub fn open_orders(&self) -> &BTreeMap<String, Decimal> {
        if self.direction.open_is_ask() {
            &self.sell_orders
        } else {
            &self.buy_orders
        }
    }

    /// Orders on the profit-taking side
    pub fn close_orders(&self) -> &BTreeMap<String, Decimal> {
        if self.direction.open_is_ask() {
            &self.buy_orders
        } else {
            &self.sell_orders
        }
    }

    pub fn open_count(&self) -> usize {
        self.open_orders().len()
    }

    pub fn close_count(&self) -> usize {
        self.close_orders().len()
    }

    pub fn side_orders(&self, is_ask: bool) -> &BTreeMap<String, Decimal> {
        if is_ask {
            &self.sell_orders
        } else {
            &self.buy_orders
        }
    }

    pub fn side_orders_mut(&mut self, is_ask: bool) -> &mut BTreeMap<String, Decimal> {
        if is_ask {
            &mut self.sell_orders
        } else {
            &mut self.buy_orders
        }
    }

    pub fn insert_order(&mut self, id: impl Into<String>, is_ask: bool, price: Decimal) {
        self.side_orders_mut(is_ask).insert(id.into(), price);
    }

    pub fn remove_order(&mut self, id: &str, is_ask: bool) -> Option<Decimal> {
        self.side_orders_mut(is_ask).remove(id)
    }

    /// Remove the resting order nearest to `price` within `tolerance`.
    ///
    /// Fallback for fills whose id the engine never saw (placed before a
    /// restart, or re-keyed by the venue).
    pub fn remove_nearest_at_price(
        &mut self,
        is_ask: bool,
        price: Decimal,
        tolerance: Decimal,
    ) -> Option<(String, Decimal)> {
        let book = self.side_orders(is_ask);
        let (id, entry_price) = book
            .iter()
            .map(|(id, p)| (id.clone(), *p))
            .min_by_key(|(_, p)| (*p - price).abs())?;
        if (entry_price - price).abs() > tolerance {
            return None;
        }
        self.side_orders_mut(is_ask).remove(&id);
        Some((id, entry_price))
    }

    pub fn tracks_id(&self, id: &str) -> bool {
        self.buy_orders.contains_key(id)
            || self.sell_orders.contains_key(id)
            || self.placeholder_orders.contains_key(id)
    }

    /// Closest open-side rung to spot (highest buy for Long).
    pub fn nearest_open_price(&self) -> Option<Decimal> {
        if self.direction.open_is_ask() {
            self.open_orders().values().min().copied()
        } else {
            self.open_orders().values().max().copied()
        }
    }

    /// Open-side rung furthest into the trend (lowest buy for Long).
    pub fn furthest_open_price(&self) -> Option<Decimal> {
        if self.direction.open_is_ask() {
            self.open_orders().values().max().copied()
        } else {
            self.open_orders().values().min().copied()
        }
    }

    /// Closest close-side rung to spot (lowest sell for Long).
    pub fn nearest_close_price(&self) -> Option<Decimal> {
        if self.direction.close_is_ask() {
            self.close_orders().values().min().copied()
        } else {
            self.close_orders().values().max().copied()
        }
    }

    /// Close-side rung furthest from spot (highest sell for Long).
    pub fn furthest_close_price(&self) -> Option<Decimal> {
        if self.direction.close_is_ask() {
            self.close_orders().values().max().copied()
        } else {
            self.close_orders().values().min().copied()
        }
    }

    /// Replace the placeholder book and rebuild the price index.
    pub fn set_placeholders(&mut self, orders: BTreeMap<String, PlaceholderOrder>) {
        self.placeholder_positions = orders.values().map(|p| (p.price, p.size)).collect();
        self.placeholder_orders = orders;
    }

    pub fn add_placeholder(&mut self, id: impl Into<String>, price: Decimal, size: Decimal) {
        self.placeholder_orders
            .insert(id.into(), PlaceholderOrder { price, size });
        self.placeholder_positions.insert(price, size);
    }

    /// Placeholder inventory still waiting for price to reach it.
    ///
    /// A placeholder releases its inventory once spot crosses its price; until
    /// then the parked size is not available to the grid.
    pub fn pending_release(&self) -> Decimal {
        let Some(current) = self.current_price else {
            // No price yet: everything parked counts as frozen.
            return self.placeholder_positions.values().copied().sum();
        };
        self.placeholder_positions
            .iter()
            .filter(|(price, _)| {
                if self.direction.close_is_ask() {
                    **price > current
                } else {
                    **price < current
                }
            })
            .map(|(_, size)| *size)
            .sum()
    }

    /// Re-derive `available_position` from inventory and parked sizes.
    pub fn recompute_available(&mut self) {
        let available = self.position_abs - self.pending_release();
        self.available_position = available.max(Decimal::ZERO);
    }

    pub fn in_startup_grace(&self) -> bool {
        self.start_time.elapsed() < STARTUP_GRACE
    }

    pub fn mark_replenished(&mut self) {
        self.last_replenish_time = Some(Instant::now());
    }

    /// Whether the periodic loop should run its own replenish pass.
    pub fn replenish_due(&self, quiet: Duration) -> bool {
        match self.last_replenish_time {
            Some(at) => at.elapsed() > quiet,
            None => true,
        }
    }

    pub fn runtime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_state() -> GridState {
        let mut state = GridState::new(Direction::Long);
        state.current_price = Some(dec!(3000));
        state.insert_order("b1", false, dec!(2998.5));
        state.insert_order("b2", false, dec!(2997.0));
        state.insert_order("s1", true, dec!(3001.5));
        state.insert_order("s2", true, dec!(3003.0));
        state
    }

    #[test]
    fn test_direction_flags() {
        assert!(!Direction::Long.open_is_ask());
        assert!(Direction::Long.close_is_ask());
        assert!(Direction::Short.open_is_ask());
        assert!(!Direction::Short.close_is_ask());
    }

    #[test]
    fn test_side_views_long() {
        let state = long_state();
        assert_eq!(state.open_count(), 2);
        assert_eq!(state.close_count(), 2);
        assert_eq!(state.nearest_open_price(), Some(dec!(2998.5)));
        assert_eq!(state.furthest_open_price(), Some(dec!(2997.0)));
        assert_eq!(state.nearest_close_price(), Some(dec!(3001.5)));
        assert_eq!(state.furthest_close_price(), Some(dec!(3003.0)));
    }

    #[test]
    fn test_side_views_short() {
        let mut state = GridState::new(Direction::Short);
        state.insert_order("s1", true, dec!(3001.5));
        state.insert_order("s2", true, dec!(3003.0));
        state.insert_order("b1", false, dec!(2998.5));
        // For Short the opens are the sells.
        assert_eq!(state.open_count(), 2);
        assert_eq!(state.close_count(), 1);
        assert_eq!(state.nearest_open_price(), Some(dec!(3001.5)));
        assert_eq!(state.furthest_open_price(), Some(dec!(3003.0)));
        assert_eq!(state.nearest_close_price(), Some(dec!(2998.5)));
    }

    #[test]
    fn test_remove_nearest_at_price() {
        let mut state = long_state();
        let hit = state.remove_nearest_at_price(false, dec!(2998.4), dec!(0.6));
        assert_eq!(hit, Some(("b1".to_string(), dec!(2998.5))));
        assert_eq!(state.open_count(), 1);

        // Outside tolerance: nothing removed.
        let miss = state.remove_nearest_at_price(false, dec!(2990.0), dec!(0.6));
        assert!(miss.is_none());
        assert_eq!(state.open_count(), 1);
    }

    #[test]
    fn test_pending_release_long() {
        let mut state = long_state();
        state.position_abs = dec!(0.07);
        state.add_placeholder("p1", dec!(3010), dec!(0.03));
        state.add_placeholder("p2", dec!(2995), dec!(0.02));
        // Only the placeholder above spot is still pending for Long.
        assert_eq!(state.pending_release(), dec!(0.03));
        state.recompute_available();
        assert_eq!(state.available_position, dec!(0.04));
    }

    #[test]
    fn test_available_never_negative() {
        let mut state = long_state();
        state.position_abs = dec!(0.01);
        state.add_placeholder("p1", dec!(3010), dec!(0.05));
        state.recompute_available();
        assert_eq!(state.available_position, Decimal::ZERO);
    }

    #[test]
    fn test_bounded_set_trims_fifo() {
        let mut set = BoundedSet::new(3);
        for i in 0..5 {
            assert!(set.insert(format!("k{i}")));
        }
        assert_eq!(set.len(), 3);
        assert!(!set.contains("k0"));
        assert!(!set.contains("k1"));
        assert!(set.contains("k4"));
        // Re-inserting an existing key is a no-op.
        assert!(!set.insert("k4"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_initial_flags() {
        let state = GridState::new(Direction::Long);
        assert!(state.last_fill_was_close_side);
        assert!(!state.grid_paused);
        assert!(!state.placeholder_exists);
    }
}
