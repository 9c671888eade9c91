//! Tick/step decimal arithmetic
//!
//! Every price and size the engine emits is a `rust_decimal::Decimal` snapped
//! to an exchange tick or lot step with half-up rounding. Binary floats never
//! touch order math.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Snap `value` to the nearest multiple of `step`, rounding half-up.
///
/// A non-positive step returns the value untouched.
pub fn quantize(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    steps * step
}

/// Half-up rounding to a fixed number of decimal places.
pub fn round_dp(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Render `value` on the wire with exactly the decimal width of `step`.
pub fn fmt_step(value: Decimal, step: Decimal) -> String {
    if step <= Decimal::ZERO {
        return value.to_string();
    }
    let mut quantized = quantize(value, step);
    quantized.rescale(step.scale());
    quantized.to_string()
}

/// Candidate price ticks to walk when the venue rejects on tick mismatch.
///
/// The configured tick is tried first; on a successful placement with a
/// fallback tick the gateway promotes it to the working tick.
pub fn tick_ladder(configured: Decimal) -> Vec<Decimal> {
    let fallbacks = [dec!(0.5), dec!(0.1), dec!(1), dec!(0.05), dec!(0.01)];
    let mut out: Vec<Decimal> = Vec::with_capacity(1 + fallbacks.len());
    for tick in std::iter::once(configured).chain(fallbacks) {
        if tick > Decimal::ZERO && !out.contains(&tick) {
            out.push(tick);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_half_up() {
        assert_eq!(quantize(dec!(3001.25), dec!(0.5)), dec!(3001.5));
        assert_eq!(quantize(dec!(3001.24), dec!(0.5)), dec!(3001.0));
        assert_eq!(quantize(dec!(2998.505), dec!(0.01)), dec!(2998.51));
        assert_eq!(quantize(dec!(1.5), dec!(1)), dec!(2));
    }

    #[test]
    fn test_quantize_ignores_bad_step() {
        assert_eq!(quantize(dec!(12.34), Decimal::ZERO), dec!(12.34));
        assert_eq!(quantize(dec!(12.34), dec!(-0.1)), dec!(12.34));
    }

    #[test]
    fn test_quantize_no_drift_over_ladder() {
        // Subtracting a step from a quantized price stays on the grid.
        let step = dec!(1.50);
        let mut price = quantize(dec!(3000.00), dec!(0.01));
        for _ in 0..100 {
            price -= step;
            assert_eq!(price, quantize(price, dec!(0.01)));
        }
        assert_eq!(price, dec!(2850.00));
    }

    #[test]
    fn test_fmt_step_preserves_width() {
        assert_eq!(fmt_step(dec!(3000), dec!(0.01)), "3000.00");
        assert_eq!(fmt_step(dec!(2998.5), dec!(0.01)), "2998.50");
        assert_eq!(fmt_step(dec!(0.0201), dec!(0.001)), "0.020");
        assert_eq!(fmt_step(dec!(3001.26), dec!(1)), "3001");
    }

    #[test]
    fn test_tick_ladder_dedup() {
        let ladder = tick_ladder(dec!(0.1));
        assert_eq!(ladder, vec![dec!(0.1), dec!(0.5), dec!(1), dec!(0.05), dec!(0.01)]);

        let ladder = tick_ladder(dec!(0.2));
        assert_eq!(ladder.len(), 6);
        assert_eq!(ladder[0], dec!(0.2));
    }

    #[test]
    fn test_tick_ladder_skips_non_positive() {
        let ladder = tick_ladder(Decimal::ZERO);
        assert_eq!(ladder[0], dec!(0.5));
        assert_eq!(ladder.len(), 5);
    }

    #[test]
    fn test_round_dp() {
        assert_eq!(round_dp(dec!(3001.27), 1), dec!(3001.3));
        assert_eq!(round_dp(dec!(3001.31), 1), dec!(3001.3));
        assert_eq!(round_dp(dec!(0.123456789), 8), dec!(0.12345679));
    }
}
