//! Runner: event consumer plus the periodic control loop
//!
//! The gateway streams typed events onto a channel; one consumer task
//! dispatches them into the engine under its mutex. The control loop fires
//! every ~10 s: reconcile, account refresh + report, volatility step, risk
//! filters on every 6th pass, then the catch-up replenish when the streamed
//! path has been quiet.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, timeout};

use super::engine::GridEngine;
use crate::config::Settings;
use crate::errors::{GridError, GridResult};
use crate::gateway::{EventReceiver, ExchangeGateway, GatewayEvent};
use crate::notify::Notifier;

const CONTROL_TICK: Duration = Duration::from_secs(10);
/// Control ticks between risk-filter evaluations (~60 s)
const RISK_EVERY: u64 = 6;
/// Quiet window after a streamed replenish before the loop replenishes
const REPLENISH_QUIET: Duration = Duration::from_secs(5);
const PRICE_WAIT: Duration = Duration::from_secs(10);
const JOIN_DEADLINE: Duration = Duration::from_secs(5);
const CANDLE_COUNT: usize = 200;

pub struct GridRunner {
    engine: Arc<Mutex<GridEngine>>,
    gateway: Arc<dyn ExchangeGateway>,
    notifier: Option<Notifier>,
    market_id: u32,
}

impl GridRunner {
    pub fn new(settings: &Settings, gateway: Arc<dyn ExchangeGateway>) -> Self {
        let engine = GridEngine::new(settings.grid.clone(), gateway.clone());
        Self {
            engine: Arc::new(Mutex::new(engine)),
            gateway,
            notifier: Notifier::from_settings(&settings.notify),
            market_id: settings.grid.market_id,
        }
    }

    /// Drive the session until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> GridResult<()> {
        self.gateway.initialize().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.gateway.subscribe(tx).await?;
        let mut consumer = tokio::spawn(consume_events(
            self.engine.clone(),
            rx,
            shutdown.clone(),
        ));

        let started = async {
            self.wait_for_price().await?;
            self.engine.lock().await.startup().await
        }
        .await;
        if let Err(e) = started {
            consumer.abort();
            let _ = self.gateway.close().await;
            return Err(e);
        }
        self.notify("grid session started").await;

        let mut tick = interval(CONTROL_TICK);
        tick.tick().await;
        let mut counter: u64 = 0;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    counter += 1;
                    match self.control_tick(counter).await {
                        Ok(Some(note)) => self.notify(note).await,
                        Ok(None) => {}
                        Err(e) => warn!("Control tick failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Stop requested, shutting down");
        {
            let mut engine = self.engine.lock().await;
            if let Err(e) = engine.shutdown().await {
                warn!("Shutdown incomplete: {e}");
            }
        }
        self.notify("grid session stopped").await;

        if timeout(JOIN_DEADLINE, &mut consumer).await.is_err() {
            warn!("Event consumer still running after {JOIN_DEADLINE:?}, aborting it");
            consumer.abort();
        }
        Ok(())
    }

    /// Startup needs a market price; give the stream a bounded head start.
    async fn wait_for_price(&self) -> GridResult<()> {
        let deadline = tokio::time::Instant::now() + PRICE_WAIT;
        loop {
            {
                let engine = self.engine.lock().await;
                if engine.state.current_price.is_some() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GridError::Gateway(
                    "no market price received within the startup window".into(),
                ));
            }
            info!("Waiting for the first price tick...");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// One pass of the periodic loop. Returns a notifier message when the
    /// pause state flipped.
    async fn control_tick(&self, counter: u64) -> GridResult<Option<&'static str>> {
        let mut engine = self.engine.lock().await;

        if let Err(e) = engine.sync_orders().await {
            warn!("Order sync failed: {e}");
        }
        if let Err(e) = engine.refresh_account().await {
            warn!("Account refresh failed: {e}");
        }

        match self
            .gateway
            .candle_stick(self.market_id, "1m", CANDLE_COUNT)
            .await
        {
            Ok(candles) if !candles.is_empty() => {
                engine.update_dynamic_step(candles);
            }
            Ok(_) => {}
            Err(e) => warn!("1m candle refresh failed: {e}"),
        }

        let mut pause_note = None;
        if counter % RISK_EVERY == 0 {
            let was_paused = engine.state.grid_paused;
            if let Err(e) = engine.risk_check(false).await {
                warn!("Risk check failed: {e}");
            }
            pause_note = match (was_paused, engine.state.grid_paused) {
                (false, true) => Some("risk filters fired, grid paused"),
                (true, false) => Some("risk filters clear, grid resumed"),
                _ => None,
            };
        }

        if engine.state.replenish_due(REPLENISH_QUIET) {
            if let Err(e) = engine.reconcile_trades().await {
                warn!("Trade reconciliation failed: {e}");
            }
            engine.prune_orders().await;
            if let Err(e) = engine.replenish_grid(false, Decimal::ZERO).await {
                warn!("Periodic replenish failed: {e}");
            }
        }

        Ok(pause_note)
    }

    async fn notify(&self, text: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.send(text).await;
        }
    }
}

/// Single consumer: every event mutates the engine under the one lock, so
/// stream handling and the control loop never interleave mid-decision.
async fn consume_events(
    engine: Arc<Mutex<GridEngine>>,
    mut rx: EventReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    GatewayEvent::Price(price) => {
                        let mut engine = engine.lock().await;
                        engine.on_price_tick(price);
                    }
                    GatewayEvent::Orders(orders) => {
                        let mut engine = engine.lock().await;
                        engine.handle_order_updates(orders).await;
                    }
                    GatewayEvent::Positions(positions) => {
                        let mut engine = engine.lock().await;
                        for position in positions {
                            engine.apply_position(position.qty.abs());
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Event consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewaySettings, GridSettings, NotifySettings};
    use crate::gateway::mock::MockGateway;
    use crate::grid::state::Direction;
    use rust_decimal_macros::dec;

    fn test_settings() -> Settings {
        Settings {
            grid: GridSettings::new(Direction::Long, 3, dec!(0.01), dec!(0.05)),
            gateway: GatewaySettings::default(),
            notify: NotifySettings::default(),
        }
    }

    #[tokio::test]
    async fn test_run_starts_and_stops_cleanly() {
        let mock = Arc::new(MockGateway::new());
        let runner = GridRunner::new(&test_settings(), mock.clone() as Arc<dyn ExchangeGateway>);
        runner.engine.lock().await.state.current_price = Some(dec!(3000.00));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { runner.run(stop_rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // The ladder went out at startup and was cancelled at shutdown.
        assert_eq!(mock.open_order_count().await, 0);
        assert_eq!(mock.cancelled.lock().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fails_without_price() {
        let mock = Arc::new(MockGateway::new());
        let runner = GridRunner::new(&test_settings(), mock as Arc<dyn ExchangeGateway>);

        let (_stop_tx, stop_rx) = watch::channel(false);
        // No price ever arrives: startup aborts after the wait window.
        let result = tokio::time::timeout(Duration::from_secs(15), runner.run(stop_rx)).await;
        assert!(matches!(result, Ok(Err(_))));
    }
}
