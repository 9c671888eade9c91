//! The grid engine
//!
//! One owned value holding the authoritative state and the gateway handle.
//! Every method that mutates state runs under the runner's single async
//! mutex, so the engine is free to hold decisions across gateway awaits: it
//! re-reads its own state after each call instead of trusting stale locals.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::state::GridState;
use super::{fills, geometry, reconcile, risk};
use crate::config::GridSettings;
use crate::errors::{GridError, GridResult};
use crate::gateway::{ExchangeGateway, Order, OrderSpec};
use crate::indicators::Candle;
use crate::profit_log::ProfitLog;
use crate::quantize::{quantize, round_dp};

/// Trades pulled per reconciliation sweep
const TRADE_RECONCILE_LIMIT: usize = 50;

/// Share of realized profit reduce mode may spend on unwinding
const REDUCE_RETENTION: Decimal = dec!(0.7);

pub struct GridEngine {
    cfg: GridSettings,
    gateway: Arc<dyn ExchangeGateway>,
    pub state: GridState,
    profit_log: Option<ProfitLog>,
    /// Latest 1-minute candles, cached for price-tick volatility checks
    candles_1m: Vec<Candle>,
}

impl GridEngine {
    pub fn new(cfg: GridSettings, gateway: Arc<dyn ExchangeGateway>) -> Self {
        let profit_log = cfg.profit_log.as_ref().and_then(|path| {
            match ProfitLog::open(path) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!("Profit log disabled, cannot open {path:?}: {e}");
                    None
                }
            }
        });
        let state = GridState::new(cfg.direction);
        Self {
            cfg,
            gateway,
            state,
            profit_log,
            candles_1m: Vec::new(),
        }
    }

    pub fn settings(&self) -> &GridSettings {
        &self.cfg
    }

    /// Session startup: snapshot the account, run the startup risk check,
    /// adopt any resting book or place the initial ladder. Requires a market
    /// price, so the runner waits for the first tick before calling this.
    pub async fn startup(&mut self) -> GridResult<()> {
        let account = self.gateway.get_account_info().await?;
        self.state.start_equity = account.total_equity;
        self.state.current_equity = account.total_equity;
        if let Some(position) = account.primary_position() {
            self.apply_position(position.qty.abs());
        }

        match self.gateway.get_trades_by_rest(0, 1).await {
            Ok(trades) => {
                if let Some(last) = trades.first() {
                    self.state.last_trade_price = last.price;
                    info!("Last traded price: {}", last.price);
                }
            }
            Err(e) => warn!("Could not fetch last trade at startup: {e}"),
        }

        let base_price = self.state.current_price.ok_or_else(|| {
            GridError::Gateway("no market price received before startup".into())
        })?;

        if let Err(e) = self.risk_check(true).await {
            warn!("Startup risk check failed: {e}");
        }

        self.sync_orders().await?;

        let ladder = geometry::initial_ladder(
            self.cfg.direction,
            base_price,
            self.cfg.grid_count,
            self.cfg.grid_spread,
            self.cfg.price_tick,
        );
        let fallback_step = quantize(
            base_price * self.cfg.grid_spread / dec!(100),
            self.cfg.price_tick,
        );
        self.state.base_step = geometry::base_step_of(&ladder).unwrap_or(fallback_step);
        if self.state.active_step <= Decimal::ZERO {
            self.state.active_step = self.state.base_step;
        }

        if self.state.open_count() > 0 || self.state.close_count() > 0 {
            info!(
                "Adopting resting book: {} open / {} close orders, skipping initial placement",
                self.state.open_count(),
                self.state.close_count()
            );
            self.prune_orders().await;
        } else if !self.state.grid_paused {
            self.place_initial_ladder(&ladder).await?;
        } else {
            info!("Grid paused at startup, initial ladder withheld");
        }

        info!(
            "Engine started: direction={:?} base_step={} rungs={}",
            self.cfg.direction, self.state.base_step, self.cfg.grid_count
        );
        Ok(())
    }

    async fn place_initial_ladder(&mut self, ladder: &[Decimal]) -> GridResult<()> {
        let open_ask = self.cfg.direction.open_is_ask();
        let specs: Vec<OrderSpec> = ladder
            .iter()
            .map(|price| OrderSpec::new(open_ask, *price, self.cfg.grid_amount))
            .collect();
        let ids = self.gateway.place_multi_orders(&specs).await?;
        for (id, spec) in ids.iter().zip(&specs) {
            self.state.insert_order(id.clone(), spec.is_ask, spec.price);
        }
        info!("Placed initial ladder: {ladder:?}");
        Ok(())
    }

    /// Ingest an absolute position size, refreshing availability and the
    /// inventory alert flags.
    pub fn apply_position(&mut self, position_abs: Decimal) {
        self.state.position_abs = position_abs;
        self.state.recompute_available();

        if position_abs == Decimal::ZERO {
            return;
        }

        if position_abs >= self.cfg.alert_position && position_abs < self.cfg.decrease_position {
            self.state.open_spread_alert = true;
            self.state.decrease_mode = false;
        } else if position_abs >= self.cfg.decrease_position {
            self.state.open_spread_alert = true;
            self.state.decrease_mode = true;
        } else {
            self.state.open_spread_alert = false;
            self.state.decrease_mode = false;
        }

        if position_abs > self.cfg.max_position {
            warn!(
                "Inventory {} over the cap {}, pausing the grid",
                position_abs, self.cfg.max_position
            );
            self.state.grid_paused = true;
        }
    }

    /// Pull broker truth and rebuild the local book from it.
    pub async fn sync_orders(&mut self) -> GridResult<()> {
        let snapshot = self.gateway.get_orders_by_rest().await?;
        let book = reconcile::rebuild(&snapshot, self.cfg.direction, self.cfg.grid_amount);
        reconcile::apply(&mut self.state, book);
        debug!(
            "Synced book: {} buys, {} sells, {} placeholders",
            self.state.buy_orders.len(),
            self.state.sell_orders.len(),
            self.state.placeholder_orders.len()
        );
        Ok(())
    }

    /// Run the pruning passes in order, cancelling through the gateway.
    pub async fn prune_orders(&mut self) {
        let plan = reconcile::plan_open_overflow(&self.state, &self.cfg);
        self.cancel_orders("open-side overflow", plan).await;

        let plan = reconcile::plan_close_overflow(&self.state, &self.cfg);
        self.cancel_orders("close-side overflow", plan).await;

        if !self.state.in_startup_grace() {
            let plan = reconcile::plan_inventory_overflow(&self.state, &self.cfg);
            self.cancel_orders("inventory overflow", plan).await;
        }

        let plan = reconcile::plan_pause_cleanup(&self.state);
        self.cancel_orders("pause cleanup", plan).await;

        let plan = reconcile::plan_duplicates(&self.state);
        self.cancel_orders("duplicate price", plan).await;
    }

    async fn cancel_orders(&mut self, reason: &str, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        match self.gateway.cancel_grid_orders(&ids).await {
            Ok(true) => {
                for id in &ids {
                    self.state.buy_orders.remove(id);
                    self.state.sell_orders.remove(id);
                }
                info!("Cancelled {} orders ({reason})", ids.len());
            }
            Ok(false) => {
                // Keep the local entries; the next reconcile retries.
                warn!("Cancel unverified ({reason}): {ids:?}");
            }
            Err(e) => warn!("Cancel failed ({reason}): {e}"),
        }
    }

    /// Streamed own-order updates.
    pub async fn handle_order_updates(&mut self, orders: Vec<Order>) {
        for order in orders {
            let Some(outcome) = fills::apply_order_update(&mut self.state, &self.cfg, &order)
            else {
                continue;
            };
            info!(
                "Fill: {} {} @ {} (close_side={})",
                order.key(),
                order.side.as_str(),
                outcome.trade_price,
                outcome.is_close_side
            );
            if outcome.is_close_side {
                self.record_profit(outcome.trade_price);
            }
            if let Err(e) = self.replenish_grid(true, outcome.trade_price).await {
                warn!("Replenish after fill failed: {e}");
            }
            self.state.mark_replenished();
        }
    }

    fn record_profit(&mut self, price: Decimal) {
        let profit = self.state.base_step * self.cfg.grid_amount;
        if let Some(log) = self.profit_log.as_mut() {
            if let Err(e) = log.record(price, self.cfg.grid_amount, profit) {
                warn!("Profit log write failed: {e}");
            }
        }
    }

    /// REST trade sweep catching fills the stream dropped.
    pub async fn reconcile_trades(&mut self) -> GridResult<()> {
        let trades = self
            .gateway
            .get_trades_by_rest(0, TRADE_RECONCILE_LIMIT)
            .await?;

        if !self.state.trade_baseline_seeded {
            // First pass only records history so old trades never attribute.
            for trade in &trades {
                let key = fills::trade_key(trade);
                self.state.processed_trade_keys.insert(key);
            }
            self.state.trade_baseline_seeded = true;
            debug!("Seeded trade baseline with {} entries", trades.len());
            return Ok(());
        }

        let mut last_fill_price = None;
        for trade in &trades {
            let Some(outcome) = fills::apply_trade(&mut self.state, &self.cfg, trade) else {
                continue;
            };
            info!(
                "Recovered missed fill via REST: {} {} @ {}",
                trade.order_ref,
                trade.side.as_str(),
                trade.price
            );
            if outcome.is_close_side {
                self.record_profit(outcome.trade_price);
            }
            last_fill_price = Some(outcome.trade_price);
        }

        if let Some(price) = last_fill_price {
            self.replenish_grid(true, price).await?;
            self.state.mark_replenished();
        }
        Ok(())
    }

    /// Full replenishment pass: the fill-driven branches, large-gap fill-in,
    /// then close-side top-up.
    pub async fn replenish_grid(&mut self, filled_signal: bool, trade_price: Decimal) -> GridResult<()> {
        if self.state.grid_paused {
            debug!("Grid paused, skipping replenish");
            return Ok(());
        }

        if self.state.open_count() == 0 && self.state.close_count() == 0 {
            self.rebuild_empty_book().await?;
        }

        if filled_signal {
            self.on_open_side_filled(trade_price).await;
            self.on_close_side_filled().await;
        }

        self.fill_large_gaps().await;

        if self.state.available_position > Decimal::ZERO {
            self.top_up_close_side().await;
        }
        Ok(())
    }

    /// Both sides empty: start over from a fresh ladder around spot.
    async fn rebuild_empty_book(&mut self) -> GridResult<()> {
        let Some(base_price) = self.state.current_price else {
            return Ok(());
        };
        let mut spread = self.cfg.grid_spread;
        if self.state.open_spread_alert {
            spread *= dec!(2);
        }
        let ladder = geometry::initial_ladder(
            self.cfg.direction,
            base_price,
            self.cfg.grid_count,
            spread,
            self.cfg.price_tick,
        );
        if self.state.base_step <= Decimal::ZERO {
            if let Some(step) = geometry::base_step_of(&ladder) {
                self.state.base_step = step;
                self.state.active_step = step;
            }
        }
        info!("Book empty, re-seeding the ladder around {base_price}");
        self.place_initial_ladder(&ladder).await
    }

    /// After an open-side fill: extend the open ladder and pair the fill with
    /// a profit-taking rung, batched so both land or neither does.
    async fn on_open_side_filled(&mut self, trade_price: Decimal) {
        if self.state.last_fill_was_close_side {
            return;
        }
        let mut orders = Vec::with_capacity(2);
        if !self.state.grid_paused && self.state.open_count() < self.cfg.grid_count {
            if let Some(spec) = geometry::next_open_after_open_fill(&self.state, &self.cfg) {
                orders.push(spec);
            }
        }
        match geometry::paired_close_after_open_fill(&self.state, &self.cfg, trade_price) {
            Some(spec) => orders.push(spec),
            // No valid profit-taking rung: withhold the whole batch.
            None => return,
        }
        self.place_batch("open-side replenish", orders).await;
    }

    /// After a close-side fill: nudge the open ladder toward spot and extend
    /// the profit ladder when inventory still covers it.
    async fn on_close_side_filled(&mut self) {
        if !self.state.last_fill_was_close_side {
            return;
        }
        let mut orders = Vec::with_capacity(2);
        if !self.state.grid_paused {
            if let Some(spec) = geometry::open_after_close_fill(&self.state, &self.cfg) {
                orders.push(spec);
            }
        }
        let promised = Decimal::from(self.state.close_count() as u64) * self.cfg.grid_amount;
        if self.state.available_position > promised + self.cfg.grid_amount
            && self.state.close_count() > 0
        {
            if let Some(spec) = geometry::close_after_close_fill(&self.state, &self.cfg) {
                orders.push(spec);
            }
        }
        self.place_batch("close-side replenish", orders).await;
    }

    async fn fill_large_gaps(&mut self) {
        if self.state.grid_paused {
            return;
        }
        let plan = geometry::gap_fill(&self.state, &self.cfg);
        if let Some(spec) = plan.open {
            self.place_single("gap fill-in (open)", spec).await;
        }
        if let Some(spec) = plan.close {
            let next_promise =
                Decimal::from(self.state.close_count() as u64 + 1) * self.cfg.grid_amount;
            if self.state.available_position >= next_promise {
                self.place_single("gap fill-in (close)", spec).await;
            }
        }
    }

    /// Keep the close side populated up to the configured rung count while
    /// inventory supports it.
    async fn top_up_close_side(&mut self) {
        loop {
            let close_count = self.state.close_count();
            if close_count >= self.cfg.grid_count {
                break;
            }
            let promised = Decimal::from(close_count as u64) * self.cfg.grid_amount;
            let supported = (self.state.available_position / self.cfg.grid_amount)
                .floor()
                .to_usize()
                .unwrap_or(0);
            if self.state.available_position <= promised || close_count >= supported {
                break;
            }
            let Some(spec) = geometry::next_population_close(&self.state, &self.cfg) else {
                break;
            };
            if !self.place_single("close-side top-up", spec).await {
                break;
            }
        }
    }

    async fn place_batch(&mut self, what: &str, orders: Vec<OrderSpec>) {
        if orders.is_empty() {
            return;
        }
        match self.gateway.place_multi_orders(&orders).await {
            Ok(ids) => {
                for (id, spec) in ids.iter().zip(&orders) {
                    self.state.insert_order(id.clone(), spec.is_ask, spec.price);
                }
                info!(
                    "{what}: placed {:?}",
                    orders
                        .iter()
                        .map(|o| (o.is_ask, o.price))
                        .collect::<Vec<_>>()
                );
            }
            Err(e) => error!("{what} failed: {e}"),
        }
    }

    async fn place_single(&mut self, what: &str, spec: OrderSpec) -> bool {
        match self
            .gateway
            .place_single_order(spec.is_ask, spec.price, spec.size, None)
            .await
        {
            Ok(id) => {
                self.state.insert_order(id, spec.is_ask, spec.price);
                info!("{what}: placed {} @ {}", if spec.is_ask { "sell" } else { "buy" }, spec.price);
                true
            }
            Err(e) => {
                error!("{what} failed: {e}");
                false
            }
        }
    }

    /// Trend and reversion filters over 15-minute candles, pausing/resuming
    /// the grid and parking inventory on the first firing.
    pub async fn risk_check(&mut self, startup: bool) -> GridResult<()> {
        let candles = self
            .gateway
            .candle_stick(self.cfg.market_id, "15m", 200)
            .await?;

        let (adverse, trend) = risk::adverse_trend(&candles, self.cfg.direction);
        let (stretched, reversion) = risk::ema_reversion(&candles, self.cfg.direction);
        info!(
            "Risk filters: adverse={adverse} (adx={:.2} +di={:.2} -di={:.2} rsi={:.2}) \
             stretched={stretched} (distance={:.4})",
            trend.adx, trend.plus_di, trend.minus_di, trend.rsi, reversion.distance
        );

        if adverse || stretched {
            if !self.state.grid_paused {
                warn!("Risk filters fired, pausing the grid");
            }
            self.state.grid_paused = true;
            if startup {
                // Resting placeholders from a previous session already hold
                // the parked inventory.
                self.state.placeholder_exists = true;
            } else if !self.state.placeholder_exists {
                self.park_inventory().await;
            }
        } else if self.state.position_abs < self.cfg.max_position {
            if self.state.grid_paused {
                info!("Risk filters clear, resuming the grid");
            }
            self.state.grid_paused = false;
            self.state.placeholder_exists = false;
        }

        if self.state.grid_paused && self.state.available_position > self.cfg.grid_amount {
            self.park_inventory().await;
        }

        if self.state.decrease_mode && self.cfg.reduce_mode {
            self.reduce_position().await;
        }
        Ok(())
    }

    /// Park available inventory in breakeven-anchored placeholder orders.
    pub async fn park_inventory(&mut self) {
        if self.state.placing_placeholder {
            debug!("Parking already in flight, skipping re-entry");
            return;
        }
        if self.state.placeholder_exists {
            return;
        }
        self.state.placing_placeholder = true;

        let plan = geometry::placeholder_plan(&self.state, &self.cfg);
        if plan.is_empty() {
            self.state.placing_placeholder = false;
            return;
        }
        let total: Decimal = plan.iter().map(|o| o.size).sum();
        // Availability may have moved across awaits since the plan was cut.
        if total > self.state.available_position {
            warn!(
                "Parking plan {} exceeds available {}, aborting",
                total, self.state.available_position
            );
            self.state.placing_placeholder = false;
            return;
        }

        match self.gateway.place_multi_orders(&plan).await {
            Ok(ids) => {
                for (id, spec) in ids.iter().zip(&plan) {
                    self.state.add_placeholder(id.clone(), spec.price, spec.size);
                }
                self.state.placeholder_exists = true;
                self.state.available_position = Decimal::ZERO;
                info!(
                    "Parked {total} inventory across {} placeholder orders",
                    plan.len()
                );
            }
            Err(e) => error!("Failed to park inventory: {e}"),
        }
        self.state.placing_placeholder = false;
    }

    /// Price of the inventory slice carrying the deepest drawdown.
    fn worst_inventory_price(&self) -> Decimal {
        if let Some(order) = self
            .state
            .placeholder_orders
            .values()
            .max_by_key(|o| o.size)
        {
            return order.price;
        }
        let grids = self.state.available_position / self.cfg.grid_amount;
        self.state.last_trade_price
            + grids * self.state.base_step * self.cfg.direction.profit_sign()
    }

    /// Spend realized profit to close one rung of drawdown inventory.
    async fn reduce_position(&mut self) {
        let Some(current) = self.state.current_price else {
            return;
        };
        let target_price = self.worst_inventory_price();
        let diff = match self.cfg.direction {
            super::state::Direction::Long => target_price - current,
            super::state::Direction::Short => current - target_price,
        };
        let loss = round_dp(diff * self.cfg.grid_amount, 6);
        if loss < Decimal::ZERO {
            return;
        }
        if self.state.available_reduce_profit * REDUCE_RETENTION < loss {
            info!(
                "Reduce skipped: loss {} exceeds spendable profit {}",
                loss, self.state.available_reduce_profit
            );
            return;
        }

        // Shrink the largest placeholder by one rung first. The side is known
        // here (placeholders are always close-side), so this is a cancel and
        // re-place rather than a blind modify.
        let largest = self
            .state
            .placeholder_orders
            .iter()
            .max_by_key(|(_, o)| o.size)
            .map(|(id, o)| (id.clone(), *o));
        if let Some((id, order)) = largest {
            let cancelled = self
                .gateway
                .cancel_grid_orders(&[id.clone()])
                .await
                .unwrap_or(false);
            if cancelled {
                self.state.placeholder_orders.remove(&id);
                self.state.placeholder_positions.remove(&order.price);
                let new_size = order.size - self.cfg.grid_amount;
                if new_size >= self.cfg.grid_amount {
                    match self
                        .gateway
                        .place_single_order(
                            self.cfg.direction.close_is_ask(),
                            order.price,
                            new_size,
                            None,
                        )
                        .await
                    {
                        Ok(new_id) => {
                            self.state.add_placeholder(new_id, order.price, new_size);
                            info!("Placeholder shrunk to {} @ {}", new_size, order.price);
                        }
                        Err(e) => error!("Failed to re-place shrunk placeholder: {e}"),
                    }
                }
            }
        }

        match self
            .gateway
            .place_single_market_order(self.cfg.direction.close_is_ask(), self.cfg.grid_amount)
            .await
        {
            Ok(_) => {
                self.state.active_profit -= loss;
                // Profit spent here is retired entirely so the engine never
                // grinds all its harvest into unwinding.
                self.state.available_reduce_profit -=
                    round_dp(loss / REDUCE_RETENTION, 2);
                info!(
                    "Reduced one rung at {}, absorbed loss {}, active profit now {}",
                    current, loss, self.state.active_profit
                );
            }
            Err(e) => error!("Reduce market order failed: {e}"),
        }
    }

    /// Refresh 1-minute candles and the volatility-driven step.
    pub fn update_dynamic_step(&mut self, candles: Vec<Candle>) -> risk::RapidReading {
        let close = self
            .state
            .current_price
            .and_then(|p| p.to_f64())
            .or_else(|| candles.last().map(|c| c.close))
            .unwrap_or(0.0);
        let (is_rapid, reading) = risk::rapid_move(
            &candles,
            self.cfg.direction,
            close,
            self.cfg.rapid_move_threshold,
        );
        self.candles_1m = candles;
        if is_rapid {
            warn!(
                "Rapid adverse move: change={:.2} atr={:.2}",
                reading.change, reading.atr
            );
        }
        self.state.active_step = risk::dynamic_step(
            self.state.base_step,
            reading.atr,
            self.cfg.atr_threshold,
            self.state.open_spread_alert,
        );
        reading
    }

    /// Streamed price tick: update spot and re-derive the step when the tape
    /// is moving violently against us.
    pub fn on_price_tick(&mut self, price: Decimal) {
        self.state.current_price = Some(price);
        if self.candles_1m.is_empty() || self.state.base_step <= Decimal::ZERO {
            return;
        }
        let close = price.to_f64().unwrap_or(0.0);
        let (is_rapid, reading) = risk::rapid_move(
            &self.candles_1m,
            self.cfg.direction,
            close,
            self.cfg.rapid_move_threshold,
        );
        if is_rapid {
            self.state.active_step = risk::dynamic_step(
                self.state.base_step,
                reading.atr,
                self.cfg.atr_threshold,
                self.state.open_spread_alert,
            );
        }
    }

    /// Account refresh plus the periodic run report.
    pub async fn refresh_account(&mut self) -> GridResult<()> {
        let account = self.gateway.get_account_info().await?;
        self.state.current_equity = account.total_equity;
        let (qty, unrealized) = match account.primary_position() {
            Some(p) => (p.qty.abs(), p.unrealized_pnl),
            None => (Decimal::ZERO, Decimal::ZERO),
        };
        self.apply_position(qty);
        self.log_run_report(unrealized);
        Ok(())
    }

    fn log_run_report(&self, unrealized_pnl: Decimal) {
        let marked_equity = self.state.current_equity + unrealized_pnl;
        let pnl = marked_equity - self.state.start_equity;
        let frozen = self.state.pending_release();
        let buys: Vec<Decimal> = self.state.buy_orders.values().copied().collect();
        let sells: Vec<Decimal> = self.state.sell_orders.values().copied().collect();
        info!(
            "\n==================== run report ====================\n\
             [equity]    start: {} | now: {} | pnl: {}\n\
             [profit]    total: {} | active: {} | reduce: {}\n\
             [inventory] position: {} | frozen: {} | available: {}\n\
             [status]    runtime: {} | fills: {} | step: {} | paused: {}\n\
             [market]    price: {} | last trade: {}\n\
             [orders]    buys: {:?} | sells: {:?}\n\
             ====================================================",
            round_dp(self.state.start_equity, 6),
            round_dp(marked_equity, 6),
            round_dp(pnl, 6),
            round_dp(self.state.total_profit, 2),
            round_dp(self.state.active_profit, 2),
            round_dp(self.state.available_reduce_profit, 2),
            self.state.position_abs,
            frozen,
            self.state.available_position,
            format_runtime(self.state.runtime()),
            self.state.filled_count,
            round_dp(self.state.active_step, 2),
            self.state.grid_paused,
            self.state
                .current_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            self.state.last_trade_price,
            buys,
            sells,
        );
    }

    /// Leave no grid orders behind; placeholders keep resting.
    pub async fn shutdown(&mut self) -> GridResult<()> {
        let ids: Vec<String> = self
            .state
            .buy_orders
            .keys()
            .chain(self.state.sell_orders.keys())
            .cloned()
            .collect();
        if !ids.is_empty() {
            self.cancel_orders("shutdown", ids).await;
        }
        self.gateway.close().await
    }
}

fn format_runtime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("{days}d {hours}h {minutes}m {seconds}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::gateway::{OrderStatus, Position, Side, Trade};
    use crate::grid::state::Direction;
    use crate::indicators::Candle;

    fn cfg() -> GridSettings {
        GridSettings::new(Direction::Long, 3, dec!(0.01), dec!(0.05))
    }

    async fn engine_with_mock(cfg: GridSettings) -> (GridEngine, Arc<MockGateway>) {
        let mock = Arc::new(MockGateway::new());
        let engine = GridEngine::new(cfg, mock.clone() as Arc<dyn ExchangeGateway>);
        (engine, mock)
    }

    fn falling_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 3200.0 - 5.0 * i as f64;
                Candle {
                    time: i as i64 * 900_000,
                    open: close + 5.0,
                    high: close + 6.0,
                    low: close - 1.0,
                    close,
                    volume: 10.0,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_startup_places_initial_ladder() {
        let (mut engine, mock) = engine_with_mock(cfg()).await;
        engine.state.current_price = Some(dec!(3000.00));

        engine.startup().await.unwrap();

        // Scenario: LONG, 3 rungs, 0.05% of 3000 = 1.50 per rung.
        assert_eq!(engine.state.base_step, dec!(1.50));
        assert_eq!(engine.state.active_step, dec!(1.50));
        let buys: Vec<Decimal> = engine.state.buy_orders.values().copied().collect();
        assert!(buys.contains(&dec!(2998.50)));
        assert!(buys.contains(&dec!(2997.00)));
        assert!(buys.contains(&dec!(2995.50)));
        assert_eq!(mock.open_order_count().await, 3);
    }

    #[tokio::test]
    async fn test_startup_adopts_existing_book() {
        let (mut engine, mock) = engine_with_mock(cfg()).await;
        engine.state.current_price = Some(dec!(3000.00));
        mock.push_open_order(crate::gateway::Order {
            id: "1".into(),
            client_order_id: "resting".into(),
            side: Side::Buy,
            price: dec!(2996.00),
            size: dec!(0.01),
            filled_size: Decimal::ZERO,
            status: OrderStatus::Open,
        })
        .await;

        engine.startup().await.unwrap();

        // The resting order was adopted, no fresh ladder went out.
        assert_eq!(mock.open_order_count().await, 1);
        assert!(engine.state.tracks_id("resting"));
        // base_step still derives from the would-be ladder.
        assert_eq!(engine.state.base_step, dec!(1.50));
    }

    #[tokio::test]
    async fn test_open_side_fill_replenishes_both_sides() {
        let (mut engine, _mock) = engine_with_mock(cfg()).await;
        engine.state.current_price = Some(dec!(3000.00));
        engine.startup().await.unwrap();

        // The top rung fills and spot slips under it.
        engine.state.current_price = Some(dec!(2999.00));
        let fill_id = engine
            .state
            .buy_orders
            .iter()
            .find(|(_, p)| **p == dec!(2998.50))
            .map(|(id, _)| id.clone())
            .unwrap();
        engine
            .handle_order_updates(vec![crate::gateway::Order {
                id: String::new(),
                client_order_id: fill_id,
                side: Side::Buy,
                price: dec!(2998.50),
                size: dec!(0.01),
                filled_size: dec!(0.01),
                status: OrderStatus::Filled,
            }])
            .await;

        assert!(!engine.state.last_fill_was_close_side);
        // New furthest buy one step past the old end of the ladder.
        let buys: Vec<Decimal> = engine.state.buy_orders.values().copied().collect();
        assert!(buys.contains(&dec!(2994.00)), "buys: {buys:?}");
        // Paired profit-taking sell at fill + base_step.
        let sells: Vec<Decimal> = engine.state.sell_orders.values().copied().collect();
        assert!(sells.contains(&dec!(3000.00)), "sells: {sells:?}");
    }

    #[tokio::test]
    async fn test_close_side_fill_accrues_and_buys_back() {
        let (mut engine, _mock) = engine_with_mock(cfg()).await;
        engine.state.current_price = Some(dec!(3000.00));
        engine.startup().await.unwrap();

        // An earlier open-side fill consumed the 2998.50 rung and left the
        // paired sell resting at 3000.00.
        let top_rung = engine
            .state
            .buy_orders
            .iter()
            .find(|(_, p)| **p == dec!(2998.50))
            .map(|(id, _)| id.clone())
            .unwrap();
        engine.state.remove_order(&top_rung, false);
        engine.state.last_fill_was_close_side = false;
        engine.state.insert_order("sell_1", true, dec!(3000.00));
        engine.state.position_abs = dec!(0.03);
        engine.state.available_position = dec!(0.03);
        engine.state.current_price = Some(dec!(2999.50));

        engine
            .handle_order_updates(vec![crate::gateway::Order {
                id: String::new(),
                client_order_id: "sell_1".into(),
                side: Side::Sell,
                price: dec!(3000.00),
                size: dec!(0.01),
                filled_size: dec!(0.01),
                status: OrderStatus::Filled,
            }])
            .await;

        // Scenario: profit moves by exactly base_step * grid_amount = 0.015.
        assert_eq!(engine.state.total_profit, dec!(0.015));
        assert_eq!(engine.state.active_profit, dec!(0.015));
        assert_eq!(engine.state.available_reduce_profit, dec!(0.015));
        assert_eq!(engine.state.available_position, dec!(0.02));
        assert!(engine.state.last_fill_was_close_side);

        // Buy-back: one step closer to spot than the nearest resting buy.
        let buys: Vec<Decimal> = engine.state.buy_orders.values().copied().collect();
        assert!(buys.contains(&dec!(2998.50)), "buys: {buys:?}");
    }

    #[tokio::test]
    async fn test_round_trip_place_then_cancel_leaves_empty_book() {
        let (mut engine, mock) = engine_with_mock(cfg()).await;
        engine.state.current_price = Some(dec!(3000.00));
        engine.startup().await.unwrap();
        assert_eq!(engine.state.open_count(), 3);

        let ids: Vec<String> = engine.state.buy_orders.keys().cloned().collect();
        mock.cancel_grid_orders(&ids).await.unwrap();
        engine.sync_orders().await.unwrap();

        assert_eq!(engine.state.open_count(), 0);
        assert_eq!(engine.state.close_count(), 0);
    }

    #[tokio::test]
    async fn test_risk_pause_parks_inventory() {
        let (mut engine, mock) = engine_with_mock(cfg()).await;
        mock.set_candles("15m", falling_candles(80)).await;
        engine.state.current_price = Some(dec!(2990.00));
        engine.state.last_trade_price = dec!(2990.00);
        engine.state.base_step = dec!(1.5);
        engine.state.active_step = dec!(1.5);
        engine.state.position_abs = dec!(0.07);
        engine.state.available_position = dec!(0.07);

        engine.risk_check(false).await.unwrap();

        assert!(engine.state.grid_paused);
        assert!(engine.state.placeholder_exists);
        assert_eq!(engine.state.available_position, Decimal::ZERO);
        assert_eq!(engine.state.placeholder_orders.len(), 3);

        let parked: Decimal = engine
            .state
            .placeholder_orders
            .values()
            .map(|o| o.size)
            .sum();
        assert_eq!(parked, dec!(0.07));
        for order in engine.state.placeholder_orders.values() {
            assert!(order.price > dec!(2990.00));
        }

        // Re-running the check must not double-park.
        engine.risk_check(false).await.unwrap();
        assert_eq!(engine.state.placeholder_orders.len(), 3);
    }

    #[tokio::test]
    async fn test_startup_risk_pause_adopts_placeholder() {
        let (mut engine, mock) = engine_with_mock(cfg()).await;
        mock.set_candles("15m", falling_candles(80)).await;
        engine.state.current_price = Some(dec!(2990.00));
        engine.state.position_abs = dec!(0.07);
        engine.state.available_position = dec!(0.07);
        engine.state.last_trade_price = dec!(2990.00);

        engine.risk_check(true).await.unwrap();

        assert!(engine.state.grid_paused);
        assert!(engine.state.placeholder_exists);
        // Startup mode assumes resting placeholders: no new parking orders.
        assert_eq!(mock.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_pause_cleanup_cancels_grid_orders() {
        let (mut engine, mock) = engine_with_mock(cfg()).await;
        engine.state.current_price = Some(dec!(3000.00));
        engine.startup().await.unwrap();
        assert_eq!(mock.open_order_count().await, 3);

        engine.state.grid_paused = true;
        engine.prune_orders().await;

        assert_eq!(engine.state.open_count(), 0);
        assert_eq!(mock.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_trade_reconcile_seeds_then_attributes() {
        let (mut engine, mock) = engine_with_mock(cfg()).await;
        engine.state.current_price = Some(dec!(3000.00));
        engine.state.base_step = dec!(1.5);
        engine.state.active_step = dec!(1.5);
        engine.state.position_abs = dec!(0.02);
        engine.state.available_position = dec!(0.02);
        engine.state.insert_order("sell_1", true, dec!(3000.00));

        let trade = Trade {
            trade_id: Some("t1".into()),
            order_ref: "sell_1".into(),
            side: Side::Sell,
            price: dec!(3000.00),
            size: dec!(0.01),
            ts: 1_700_000_000_000,
        };
        mock.trades.lock().await.push(trade.clone());

        // First sweep only seeds the baseline.
        engine.reconcile_trades().await.unwrap();
        assert_eq!(engine.state.total_profit, Decimal::ZERO);
        assert!(engine.state.tracks_id("sell_1"));

        // A new trade after the baseline attributes normally.
        let newer = Trade {
            trade_id: Some("t2".into()),
            ..trade
        };
        mock.trades.lock().await.push(newer);
        engine.reconcile_trades().await.unwrap();
        assert_eq!(engine.state.total_profit, dec!(0.015));
        assert!(!engine.state.tracks_id("sell_1"));
    }

    #[tokio::test]
    async fn test_dynamic_step_expansion() {
        let (mut engine, _mock) = engine_with_mock(cfg()).await;
        engine.state.base_step = dec!(1.5);
        engine.state.active_step = dec!(1.5);
        engine.state.current_price = Some(dec!(3000.0));

        // ATR 14 over threshold 7: step = 0.7 * 14 = 9.8.
        let candles: Vec<Candle> = (0..30)
            .map(|i| Candle {
                time: i,
                open: 3000.0,
                high: 3007.0,
                low: 2993.0,
                close: 3000.0,
                volume: 1.0,
            })
            .collect();
        engine.update_dynamic_step(candles);
        assert_eq!(engine.state.active_step, dec!(9.8));
    }

    #[tokio::test]
    async fn test_position_limits_flags() {
        let (mut engine, _mock) = engine_with_mock(
            cfg().with_position_limits(dec!(0.05), dec!(0.08), dec!(0.1)),
        )
        .await;
        engine.state.current_price = Some(dec!(3000.0));

        engine.apply_position(dec!(0.03));
        assert!(!engine.state.open_spread_alert);

        engine.apply_position(dec!(0.06));
        assert!(engine.state.open_spread_alert);
        assert!(!engine.state.decrease_mode);

        engine.apply_position(dec!(0.09));
        assert!(engine.state.decrease_mode);

        assert!(!engine.state.grid_paused);
        engine.apply_position(dec!(0.11));
        assert!(engine.state.grid_paused);
    }

    #[tokio::test]
    async fn test_reduce_position_spends_profit() {
        let (mut engine, mock) = engine_with_mock(cfg().with_reduce_mode(true)).await;
        engine.state.current_price = Some(dec!(2990.0));
        engine.state.last_trade_price = dec!(2990.0);
        engine.state.base_step = dec!(1.5);
        engine.state.active_step = dec!(1.5);
        engine.state.decrease_mode = true;
        engine.state.available_reduce_profit = dec!(1.0);
        engine.state.add_placeholder("p1", dec!(3010.0), dec!(0.03));

        engine.reduce_position().await;

        // loss = (3010 - 2990) * 0.01 = 0.2; retention gate 1.0 * 0.7 >= 0.2.
        let market_orders = mock.market_orders.lock().await;
        assert_eq!(market_orders.len(), 1);
        assert!(market_orders[0].0, "reduce closes on the ask for Long");
        drop(market_orders);

        assert_eq!(engine.state.active_profit, dec!(-0.2));
        // 0.2 / 0.7 rounded to 2dp = 0.29 retired from the reduce budget.
        assert_eq!(engine.state.available_reduce_profit, dec!(0.71));

        // The placeholder shrank by one rung.
        let shrunk: Vec<Decimal> = engine
            .state
            .placeholder_orders
            .values()
            .map(|o| o.size)
            .collect();
        assert_eq!(shrunk, vec![dec!(0.02)]);
    }

    #[tokio::test]
    async fn test_refresh_account_updates_equity_and_position() {
        let (mut engine, mock) = engine_with_mock(cfg()).await;
        engine.state.current_price = Some(dec!(3000.0));
        {
            let mut account = mock.account.lock().await;
            account.total_equity = dec!(1000.0);
            account.positions.insert(
                "ETH-USD".into(),
                Position {
                    symbol: "ETH-USD".into(),
                    qty: dec!(0.02),
                    sign: 1,
                    entry_price: dec!(2995.0),
                    unrealized_pnl: dec!(0.1),
                },
            );
        }

        engine.refresh_account().await.unwrap();
        assert_eq!(engine.state.current_equity, dec!(1000.0));
        assert_eq!(engine.state.position_abs, dec!(0.02));
        assert_eq!(engine.state.available_position, dec!(0.02));
    }
}
