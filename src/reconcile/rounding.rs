//! Integer reconciliation of rounded partials against an exact total.
//!
//! Given `T` and non-negative reals `p_1..p_n`, produce integers `q_i` with
//! `Σ q_i == T`, each close to `round(p_i)`:
//!
//! - `|d| <= n` where `d = T - Σ round(p_i)`: ±1 on the first `|d|` entries,
//!   largest original values first when adding, smallest positive first when
//!   subtracting. Ties keep input order.
//! - `|d| > n`: `d` is spread by each partial's share of `Σ p_i` (truncated),
//!   the last partial takes whatever remains.
//!
//! For `T >= 0` no output is negative: the subtraction branch only touches
//! positive values, and any negative left by the proportional branch is
//! cleared by withdrawing the deficit from the largest values.

use itertools::Itertools;
use smallvec::SmallVec;

pub type Counts = SmallVec<[i64; 8]>;

/// Which correction path produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// Independent rounding already summed to the target.
    None,
    /// `|d| <= n`: unit steps.
    UnitSteps,
    /// `|d| > n`: proportional spread with residual on the last partial.
    Proportional,
    /// No partials to carry a nonzero target.
    Unsatisfiable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub values: Counts,
    pub correction: Correction,
}

/// Round half to even; non-finite input rounds to 0.
#[inline]
pub fn round_half_even(x: f64) -> i64 {
    if x.is_finite() { x.round_ties_even() as i64 } else { 0 }
}

#[inline]
fn clean(p: f64) -> f64 {
    if p.is_finite() { p } else { 0.0 }
}

/// Rounds `partials` so they sum to `target` exactly. Never fails.
pub fn reconcile_to_total(target: i64, partials: &[f64]) -> Reconciled {
    let n = partials.len();
    let mut values: Counts = partials.iter().map(|&p| round_half_even(p)).collect();
    if n == 0 {
        let correction = if target == 0 {
            Correction::None
        } else {
            Correction::Unsatisfiable
        };
        return Reconciled { values, correction };
    }

    let discrepancy = target - values.iter().sum::<i64>();
    if discrepancy == 0 {
        return Reconciled {
            values,
            correction: Correction::None,
        };
    }

    let correction = if discrepancy.unsigned_abs() <= n as u64 {
        if discrepancy > 0 {
            add_to_largest(&mut values, partials, discrepancy);
        } else {
            take_from_smallest(&mut values, partials, -discrepancy);
        }
        Correction::UnitSteps
    } else {
        spread_proportionally(&mut values, partials, discrepancy);
        if target >= 0 {
            settle_negatives(&mut values);
        }
        Correction::Proportional
    };

    Reconciled { values, correction }
}

fn add_to_largest(values: &mut Counts, partials: &[f64], d: i64) {
    // stable sort: tied originals keep list order
    let order = (0..partials.len())
        .sorted_by(|&a, &b| clean(partials[b]).total_cmp(&clean(partials[a])));
    for i in order.take(d as usize) {
        values[i] += 1;
    }
}

fn take_from_smallest(values: &mut Counts, partials: &[f64], d: i64) {
    let mut remaining = d;
    while remaining > 0 {
        let order: Vec<usize> = (0..partials.len())
            .filter(|&i| values[i] > 0)
            .sorted_by(|&a, &b| clean(partials[a]).total_cmp(&clean(partials[b])))
            .collect();
        if order.is_empty() {
            // only reachable for a negative target
            break;
        }
        for i in order.into_iter().take(remaining as usize) {
            values[i] -= 1;
            remaining -= 1;
        }
    }
}

fn spread_proportionally(values: &mut Counts, partials: &[f64], d: i64) {
    let n = partials.len();
    let total: f64 = partials.iter().map(|&p| clean(p)).sum();
    let mut applied = 0i64;
    for i in 0..n - 1 {
        let proportion = if total != 0.0 {
            clean(partials[i]) / total
        } else {
            1.0 / n as f64
        };
        let adj = (d as f64 * proportion).trunc() as i64;
        values[i] += adj;
        applied += adj;
    }
    values[n - 1] += d - applied;
}

/// Zeroes negatives and withdraws the deficit from the largest values,
/// keeping the sum unchanged. Requires a non-negative sum to fully settle.
fn settle_negatives(values: &mut Counts) {
    let mut deficit: i64 = 0;
    for v in values.iter_mut() {
        if *v < 0 {
            deficit += -*v;
            *v = 0;
        }
    }
    while deficit > 0 {
        let Some((top, &max)) = values.iter().enumerate().max_by_key(|&(i, v)| (*v, -(i as i64)))
        else {
            break;
        };
        if max <= 0 {
            break;
        }
        let runner_up = values
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != top)
            .map(|(_, &v)| v)
            .max()
            .unwrap_or(0)
            .max(0);
        let step = (max - runner_up).max(1).min(deficit);
        values[top] -= step;
        deficit -= step;
    }
}
