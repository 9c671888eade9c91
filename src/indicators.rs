//! Technical indicators over candle series
//!
//! Pure functions, no state: each returns a series aligned with its input so
//! callers can restart from arbitrary sub-slices. Warmup slots are `NaN`,
//! mirroring how rolling windows behave in the usual dataframe stacks.

/// A single OHLCV candle. `time` is epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Exponential moving average with `alpha = 2 / (period + 1)`, seeded at the
/// first value.
pub fn ema_values(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    out.push(prev);
    for &v in &values[1..] {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

/// EMA over closes.
pub fn ema(candles: &[Candle], period: usize) -> Vec<f64> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    ema_values(&closes, period)
}

/// Wilder RSI over close deltas. Warmup slots (the first `period` entries)
/// are `NaN`.
pub fn rsi(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    if n == 0 || period == 0 {
        return Vec::new();
    }
    let mut out = vec![f64::NAN; n];
    if n <= period {
        return out;
    }

    let mut gains = vec![0.0; n];
    let mut losses = vec![0.0; n];
    for i in 1..n {
        let delta = candles[i].close - candles[i - 1].close;
        if delta > 0.0 {
            gains[i] = delta;
        } else {
            losses[i] = -delta;
        }
    }

    let mut avg_gain: f64 = gains[1..=period].iter().sum::<f64>() / period as f64;
    let mut avg_loss: f64 = losses[1..=period].iter().sum::<f64>() / period as f64;
    out[period] = rsi_point(avg_gain, avg_loss);
    for i in (period + 1)..n {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
        out[i] = rsi_point(avg_gain, avg_loss);
    }
    out
}

fn rsi_point(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// True range series: `max(high-low, |high-prev_close|, |low-prev_close|)`.
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let hl = c.high - c.low;
            if i == 0 {
                hl
            } else {
                let prev_close = candles[i - 1].close;
                hl.max((c.high - prev_close).abs())
                    .max((c.low - prev_close).abs())
            }
        })
        .collect()
}

/// ATR as the simple rolling mean of the true range. Warmup slots are `NaN`.
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    let tr = true_range(candles);
    rolling_mean(&tr, period)
}

/// Wilder ADX. Returns `(adx, plus_di, minus_di)` series.
pub fn adx(candles: &[Candle], period: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = candles.len();
    if n == 0 || period == 0 {
        return (Vec::new(), Vec::new(), Vec::new());
    }

    let tr = true_range(candles);
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    for i in 1..n {
        let up_move = candles[i].high - candles[i - 1].high;
        let down_move = candles[i - 1].low - candles[i].low;
        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    let alpha = 1.0 / period as f64;
    let tr_smooth = wilder_smooth(&tr, alpha);
    let plus_smooth = wilder_smooth(&plus_dm, alpha);
    let minus_smooth = wilder_smooth(&minus_dm, alpha);

    let mut plus_di = vec![0.0; n];
    let mut minus_di = vec![0.0; n];
    let mut dx = vec![0.0; n];
    for i in 0..n {
        if tr_smooth[i] > 0.0 {
            plus_di[i] = 100.0 * plus_smooth[i] / tr_smooth[i];
            minus_di[i] = 100.0 * minus_smooth[i] / tr_smooth[i];
        }
        let di_sum = plus_di[i] + minus_di[i];
        if di_sum > 0.0 {
            dx[i] = 100.0 * (plus_di[i] - minus_di[i]).abs() / di_sum;
        }
    }

    let adx = wilder_smooth(&dx, alpha);
    (adx, plus_di, minus_di)
}

fn wilder_smooth(values: &[f64], alpha: f64) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    out.push(prev);
    for &v in &values[1..] {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

fn rolling_mean(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = sum / period as f64;
    for i in period..n {
        sum += values[i] - values[i - period];
        out[i] = sum / period as f64;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_candles(close: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                time: i as i64 * 60_000,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect()
    }

    fn trending_candles(start: f64, step: f64, range: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = start + step * i as f64;
                Candle {
                    time: i as i64 * 60_000,
                    open: close - step,
                    high: close + range,
                    low: close - range,
                    close,
                    volume: 1.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_ema_flat_series() {
        let candles = flat_candles(100.0, 50);
        let out = ema(&candles, 20);
        assert_eq!(out.len(), 50);
        assert!((out[49] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_tracks_trend() {
        let candles = trending_candles(100.0, 1.0, 0.5, 100);
        let out = ema(&candles, 20);
        // EMA lags below price in a rising market.
        assert!(out[99] < candles[99].close);
        assert!(out[99] > candles[50].close);
    }

    #[test]
    fn test_rsi_warmup_and_extremes() {
        let up = trending_candles(100.0, 1.0, 0.5, 40);
        let out = rsi(&up, 14);
        assert!(out[13].is_nan());
        assert!((out[39] - 100.0).abs() < 1e-9);

        let down = trending_candles(100.0, -1.0, 0.5, 40);
        let out = rsi(&down, 14);
        assert!(out[39] < 1.0);
    }

    #[test]
    fn test_atr_constant_range() {
        // Flat closes with a fixed 2.0 high-low range: ATR converges to 2.0.
        let candles: Vec<Candle> = (0..30)
            .map(|i| Candle {
                time: i,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();
        let out = atr(&candles, 7);
        assert!(out[5].is_nan());
        assert!((out[29] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_adx_directional_bias() {
        let up = trending_candles(100.0, 2.0, 0.5, 80);
        let (adx_s, pdi, mdi) = adx(&up, 14);
        assert!(pdi[79] > mdi[79]);
        assert!(adx_s[79] > 25.0);

        let down = trending_candles(300.0, -2.0, 0.5, 80);
        let (adx_s, pdi, mdi) = adx(&down, 14);
        assert!(mdi[79] > pdi[79]);
        assert!(adx_s[79] > 25.0);
    }

    #[test]
    fn test_restartable_from_subslice() {
        let candles = trending_candles(100.0, 1.0, 0.5, 60);
        let full = atr(&candles, 7);
        let tail = atr(&candles[30..], 7);
        // Rolling-mean ATR depends only on the trailing window, so the
        // sub-slice agrees with the full series once both are warm.
        assert!((full[59] - tail[29]).abs() < 1e-9);
    }
}
