//! Trend, reversion, and volatility filters
//!
//! Pure evaluations over candle series; the engine owns the decisions the
//! readings feed (pausing, parking, step widening).

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::state::Direction;
use crate::indicators::{self, Candle};
use crate::quantize::round_dp;

/// ADX above which the market counts as trending
const ADX_TREND_THRESHOLD: f64 = 25.0;

/// EMA(60) deviation that fires the mean-reversion filter
const EMA_REVERSION_THRESHOLD: f64 = 0.02;

/// ATR period for the rapid-move detector
const RAPID_ATR_PERIOD: usize = 7;

/// Widest the volatility step may grow, in multiples of the base step
const MAX_STEP_MULTIPLE: Decimal = dec!(30);

/// Indicator snapshot behind an adverse-trend verdict
#[derive(Debug, Clone, Copy, Default)]
pub struct TrendReading {
    pub close: f64,
    pub ema: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub rsi: f64,
}

/// Adverse trend: a strong trend running against the strategy.
///
/// Long pauses on a confirmed downtrend (price under EMA, -DI dominant,
/// RSI under 50); Short mirrors.
pub fn adverse_trend(candles: &[Candle], direction: Direction) -> (bool, TrendReading) {
    if candles.len() < 20 {
        return (false, TrendReading::default());
    }

    let ema = indicators::ema(candles, 20);
    let rsi = indicators::rsi(candles, 14);
    let (adx, plus_di, minus_di) = indicators::adx(candles, 14);

    let reading = TrendReading {
        close: candles[candles.len() - 1].close,
        ema: ema[ema.len() - 1],
        adx: adx[adx.len() - 1],
        plus_di: plus_di[plus_di.len() - 1],
        minus_di: minus_di[minus_di.len() - 1],
        rsi: rsi[rsi.len() - 1],
    };

    if reading.rsi.is_nan() {
        return (false, reading);
    }

    let has_trend = reading.adx > ADX_TREND_THRESHOLD;
    let fired = match direction {
        Direction::Long => {
            reading.close < reading.ema
                && has_trend
                && reading.plus_di < reading.minus_di
                && reading.rsi < 50.0
        }
        Direction::Short => {
            reading.close > reading.ema
                && has_trend
                && reading.plus_di > reading.minus_di
                && reading.rsi > 50.0
        }
    };
    (fired, reading)
}

/// Reading behind a mean-reversion verdict
#[derive(Debug, Clone, Copy, Default)]
pub struct ReversionReading {
    pub distance: f64,
    pub threshold: f64,
}

/// EMA(60) mean-reversion filter: price stretched too far past the mean on
/// the side the strategy keeps buying into.
pub fn ema_reversion(candles: &[Candle], direction: Direction) -> (bool, ReversionReading) {
    if candles.len() < 60 {
        return (false, ReversionReading::default());
    }
    let ema = indicators::ema(candles, 60);
    let ema_value = ema[ema.len() - 1];
    if ema_value == 0.0 {
        return (false, ReversionReading::default());
    }
    let price = candles[candles.len() - 1].close;
    let distance = (price - ema_value) / ema_value;

    let reading = ReversionReading {
        distance,
        threshold: EMA_REVERSION_THRESHOLD,
    };
    let fired = match direction {
        Direction::Long => distance > EMA_REVERSION_THRESHOLD,
        Direction::Short => distance < -EMA_REVERSION_THRESHOLD,
    };
    (fired, reading)
}

/// Reading behind a rapid-move verdict
#[derive(Debug, Clone, Copy, Default)]
pub struct RapidReading {
    pub atr: f64,
    pub change: f64,
}

/// One-candle move against the strategy larger than `threshold` price units.
pub fn rapid_move(
    candles: &[Candle],
    direction: Direction,
    current_close: f64,
    threshold: f64,
) -> (bool, RapidReading) {
    if candles.is_empty() {
        return (false, RapidReading::default());
    }
    let atr_series = indicators::atr(candles, RAPID_ATR_PERIOD);
    let atr = atr_series.last().copied().unwrap_or(f64::NAN);

    let open = candles[candles.len() - 1].open;
    let change = current_close - open;

    let reading = RapidReading { atr, change };
    let fired = match direction {
        Direction::Long => change < -threshold,
        Direction::Short => change > threshold,
    };
    (fired, reading)
}

/// Working step under the current volatility regime.
///
/// Above the ATR threshold the step tracks `0.7 * ATR`, clamped between the
/// base step and thirty times it (a runaway ATR must not push rungs out of
/// reach). Below the threshold the step rests at base, doubled while the
/// inventory alert is up.
pub fn dynamic_step(
    base_step: Decimal,
    atr: f64,
    atr_threshold: f64,
    open_spread_alert: bool,
) -> Decimal {
    if base_step <= Decimal::ZERO {
        return base_step;
    }
    if atr.is_finite() && atr > atr_threshold {
        let raw = Decimal::from_f64(0.7 * atr)
            .map(|d| round_dp(d, 2))
            .unwrap_or(base_step);
        let max_step = base_step * MAX_STEP_MULTIPLE;
        return raw.clamp(base_step, max_step);
    }
    if open_spread_alert {
        base_step * dec!(2)
    } else {
        base_step
    }
}
