//! Ladder and replenishment geometry
//!
//! Pure price math: given the current book view and configuration, compute
//! which single order (or set of parking orders) to place next. Nothing here
//! talks to the gateway, so every rule is unit-testable.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::state::{Direction, GridState};
use crate::config::GridSettings;
use crate::gateway::OrderSpec;
use crate::quantize::{quantize, round_dp};

/// Initial open-side ladder: rung `i` sits `i * spread_pct` away from the
/// base price, into the trend.
pub fn initial_ladder(
    direction: Direction,
    base_price: Decimal,
    grid_count: usize,
    spread_pct: Decimal,
    tick: Decimal,
) -> Vec<Decimal> {
    let spread = spread_pct / dec!(100);
    (1..=grid_count)
        .map(|i| {
            let distance = spread * Decimal::from(i as u64);
            let price = match direction {
                Direction::Long => base_price * (Decimal::ONE - distance),
                Direction::Short => base_price * (Decimal::ONE + distance),
            };
            quantize(price, tick)
        })
        .collect()
}

/// Reference step: distance between the two closest ladder rungs.
pub fn base_step_of(ladder: &[Decimal]) -> Option<Decimal> {
    if ladder.len() < 2 {
        return None;
    }
    Some((ladder[1] - ladder[0]).abs())
}

/// Next open-side rung after an open-side fill: one `active_step` beyond the
/// furthest open rung, shifted until strictly past spot.
pub fn next_open_after_open_fill(state: &GridState, cfg: &GridSettings) -> Option<OrderSpec> {
    let current = state.current_price?;
    let step = state.active_step;
    if step <= Decimal::ZERO {
        return None;
    }
    let open_ask = state.direction.open_is_ask();
    let away = -state.direction.profit_sign();

    let furthest = state.furthest_open_price().unwrap_or(current + step * away);
    let mut price = furthest + step * away;
    if open_ask {
        while price <= current {
            price += step;
        }
    } else {
        while price >= current {
            price -= step;
        }
    }
    Some(OrderSpec::new(
        open_ask,
        quantize(price, cfg.price_tick),
        cfg.grid_amount,
    ))
}

/// Paired close-side rung after an open-side fill.
///
/// Prefers `trade_price ± base_step`; when that lands too far from spot it
/// falls back to one rung past the nearest open order. Emitted only on the
/// profitable side of spot.
pub fn paired_close_after_open_fill(
    state: &GridState,
    cfg: &GridSettings,
    trade_price: Decimal,
) -> Option<OrderSpec> {
    let current = state.current_price?;
    let base = state.base_step;
    let active = state.active_step;
    if base <= Decimal::ZERO {
        return None;
    }
    let ps = state.direction.profit_sign();
    let close_ask = state.direction.close_is_ask();

    let nearest_close = state
        .nearest_close_price()
        .unwrap_or(current + base * dec!(2) * ps);
    let nearest_open = state.nearest_open_price().unwrap_or(current - base * ps);

    let mut price = nearest_close - base * ps;
    if trade_price > Decimal::ZERO {
        price = trade_price + base * ps;
    }
    if (price - current).abs() > base * dec!(2) {
        price = nearest_open + (active + base) * ps;
    }
    let price = quantize(price, cfg.price_tick);

    let profitable = if close_ask {
        price > current
    } else {
        price < current
    };
    profitable.then(|| OrderSpec::new(close_ask, price, cfg.grid_amount))
}

/// Buy-back rung after a close-side fill: one `active_step` closer to spot
/// than the nearest open rung, never crossing it.
pub fn open_after_close_fill(state: &GridState, cfg: &GridSettings) -> Option<OrderSpec> {
    let current = state.current_price?;
    let step = state.active_step;
    if step <= Decimal::ZERO {
        return None;
    }
    let ps = state.direction.profit_sign();
    let open_ask = state.direction.open_is_ask();

    let nearest_open = state.nearest_open_price().unwrap_or(current);
    let mut price = nearest_open + step * ps;
    if open_ask {
        while price <= current {
            price += step;
        }
    } else {
        while price >= current {
            price -= step;
        }
    }
    let price = quantize(price, cfg.price_tick);
    // Backing away from spot can land on a rung that already rests; a
    // duplicate would only be pruned again on the next reconcile.
    let collides = state
        .open_orders()
        .values()
        .any(|p| round_dp(*p, 1) == round_dp(price, 1));
    if collides {
        return None;
    }
    Some(OrderSpec::new(open_ask, price, cfg.grid_amount))
}

/// Extend the profit-taking ladder after a close-side fill: one `active_step`
/// beyond the furthest close rung. Inventory preconditions are the caller's.
pub fn close_after_close_fill(state: &GridState, cfg: &GridSettings) -> Option<OrderSpec> {
    let current = state.current_price?;
    let step = state.active_step;
    if step <= Decimal::ZERO {
        return None;
    }
    let ps = state.direction.profit_sign();
    let close_ask = state.direction.close_is_ask();

    let furthest = state.furthest_close_price().unwrap_or(current);
    let mut price = furthest + step * ps;
    if close_ask {
        while price <= current {
            price += step;
        }
    } else {
        while price >= current {
            price -= step;
        }
    }
    Some(OrderSpec::new(
        close_ask,
        quantize(price, cfg.price_tick),
        cfg.grid_amount,
    ))
}

/// Large-gap fill-in plan
#[derive(Debug, Default)]
pub struct GapPlan {
    pub open: Option<OrderSpec>,
    pub close: Option<OrderSpec>,
}

impl GapPlan {
    pub fn is_empty(&self) -> bool {
        self.open.is_none() && self.close.is_none()
    }
}

/// When the two ladders drift more than `2.5 * active_step` apart, add one
/// rung on each side whose distance from spot exceeds `1.5 * active_step`.
pub fn gap_fill(state: &GridState, cfg: &GridSettings) -> GapPlan {
    let mut plan = GapPlan::default();
    let Some(current) = state.current_price else {
        return plan;
    };
    let step = state.active_step;
    if step <= Decimal::ZERO {
        return plan;
    }
    let ps = state.direction.profit_sign();
    let open_ask = state.direction.open_is_ask();
    let close_ask = state.direction.close_is_ask();

    let nearest_close = state
        .nearest_close_price()
        .unwrap_or(current + step * dec!(2) * ps);
    let nearest_open = state
        .nearest_open_price()
        .unwrap_or(current - step * dec!(2) * ps);

    if (nearest_close - nearest_open).abs() <= step * dec!(2.5) {
        return plan;
    }

    if (current - nearest_open).abs() > step * dec!(1.5) {
        // An open-side fill is already being paired by the streamed path.
        let skip = !state.last_fill_was_close_side
            && state.open_count() > 0
            && state.close_count() > 0;
        if !skip && state.open_count() < cfg.max_total_orders {
            let price = quantize(nearest_open + step * ps, cfg.price_tick);
            let ok = if open_ask {
                price > current
            } else {
                price < current
            };
            if ok {
                plan.open = Some(OrderSpec::new(open_ask, price, cfg.grid_amount));
            }
        }
    }

    if (nearest_close - current).abs() > step * dec!(1.5)
        && state.available_position > Decimal::ZERO
    {
        let skip = state.last_fill_was_close_side && state.close_count() > 0;
        if !skip && state.close_count() < cfg.max_total_orders {
            let price = quantize(nearest_open + step * dec!(2) * ps, cfg.price_tick);
            let ok = if close_ask {
                price > current
            } else {
                price < current
            };
            if ok {
                plan.close = Some(OrderSpec::new(close_ask, price, cfg.grid_amount));
            }
        }
    }

    plan
}

/// Next rung for topping the close side up to its minimum population,
/// monotonically away from spot.
pub fn next_population_close(state: &GridState, cfg: &GridSettings) -> Option<OrderSpec> {
    let current = state.current_price?;
    let step = state.active_step;
    if step <= Decimal::ZERO {
        return None;
    }
    let ps = state.direction.profit_sign();
    let close_ask = state.direction.close_is_ask();

    let furthest = match state.furthest_close_price() {
        Some(p) => p,
        None => {
            let nearest_open = state.nearest_open_price().unwrap_or(current - step * ps);
            nearest_open + step * ps
        }
    };
    let mut price = furthest + step * ps;
    if close_ask {
        while price <= current {
            price += step;
        }
    } else {
        while price >= current {
            price -= step;
        }
    }
    Some(OrderSpec::new(
        close_ask,
        quantize(price, cfg.price_tick),
        cfg.grid_amount,
    ))
}

/// Parking orders for the available inventory during a pause.
///
/// One order at breakeven for small positions; otherwise split into 2-3x
/// rungs spread symmetrically around breakeven with the larger sizes on the
/// profitable side, then shifted as a set if any rung would cross spot.
pub fn placeholder_plan(state: &GridState, cfg: &GridSettings) -> Vec<OrderSpec> {
    let amount = cfg.grid_amount;
    let available = state.available_position;
    if available < amount || state.last_trade_price <= Decimal::ZERO {
        return Vec::new();
    }
    let step = if state.active_step > Decimal::ZERO {
        state.active_step
    } else {
        state.base_step
    };
    if step <= Decimal::ZERO {
        return Vec::new();
    }
    let ps = state.direction.profit_sign();
    let close_ask = state.direction.close_is_ask();
    let current = state.current_price.unwrap_or(state.last_trade_price);
    let buffer = step * dec!(0.5);

    let range = available / amount * step;
    let breakeven = state.last_trade_price + range / dec!(2) * ps;

    if available <= amount * dec!(4) {
        let mut price = breakeven;
        if close_ask {
            if price <= current {
                price = current + buffer;
            }
        } else if price >= current {
            price = current - buffer;
        }
        return vec![OrderSpec::new(
            close_ask,
            quantize(price, cfg.price_tick),
            available,
        )];
    }

    let sizes = split_position(available, amount);
    let n = sizes.len();
    let avg_multiple = (available / amount) / Decimal::from(n as u64);
    let spacing = step * avg_multiple;

    // Offsets centered on breakeven, first slot deepest on the profitable
    // side: n=3 -> [1, 0, -1], n=4 -> [1.5, 0.5, -0.5, -1.5].
    let half = Decimal::from(n as u64) / dec!(2);
    let offsets: Vec<Decimal> = (0..n)
        .map(|i| half - dec!(0.5) - Decimal::from(i as u64))
        .collect();

    // Larger sizes take the upper slots so the volume past breakeven covers
    // the volume before it.
    let mut by_size: Vec<usize> = (0..n).collect();
    by_size.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]));

    let mut prices = vec![Decimal::ZERO; n];
    for (rank, &idx) in by_size.iter().enumerate() {
        prices[idx] = breakeven + offsets[rank] * spacing * ps;
    }

    if close_ask {
        if let Some(min_price) = prices.iter().copied().min_by(Decimal::cmp) {
            if min_price <= current {
                let offset = current - min_price + buffer;
                for p in prices.iter_mut() {
                    *p += offset;
                }
            }
        }
    } else if let Some(max_price) = prices.iter().copied().max_by(Decimal::cmp) {
        if max_price >= current {
            let offset = max_price - current + buffer;
            for p in prices.iter_mut() {
                *p -= offset;
            }
        }
    }

    prices
        .into_iter()
        .zip(sizes)
        .map(|(price, size)| OrderSpec::new(close_ask, quantize(price, cfg.price_tick), size))
        .collect()
}

/// Split parked inventory into parking-order sizes.
///
/// `remaining <= 3x` emits one order; `<= 5x` emits two equal halves (a
/// straight 2x cut would leave a sub-2x tail); otherwise peel off 2x and
/// continue. Splits always sum exactly to the total.
pub fn split_position(total: Decimal, grid_amount: Decimal) -> Vec<Decimal> {
    let mut out = Vec::new();
    if total <= Decimal::ZERO || grid_amount <= Decimal::ZERO {
        return out;
    }
    let two = grid_amount * dec!(2);
    let three = grid_amount * dec!(3);
    let five = grid_amount * dec!(5);

    let mut remaining = total;
    loop {
        if remaining <= three {
            out.push(remaining);
            break;
        }
        if remaining <= five {
            let half = remaining / dec!(2);
            out.push(half);
            out.push(remaining - half);
            break;
        }
        out.push(two);
        remaining -= two;
    }
    out
}
