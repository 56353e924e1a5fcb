//! Random rolls used by the combat rules.
//!
//! Every roll draws exactly one value from the injected `Rng`, so a scripted
//! generator can force each outcome in order (hit, crit, flee, loot...).
//! Integer picks sample 64-bit `Uniform` and `WeightedIndex` distributions,
//! which map a draw at fraction `f` of the range onto bucket `floor(f * n)`.

use rand::distributions::{Distribution, Uniform, WeightedIndex};
use rand::Rng;

/// Roll a percentage in `[0, 100)`.
pub fn roll_percent<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen::<f64>() * 100.0
}

/// Roll against a percentage chance. Returns `true` on success.
pub fn chance<R: Rng + ?Sized>(rng: &mut R, chance_percent: f64) -> bool {
    roll_percent(rng) < chance_percent
}

/// Roll against a probability in `[0, 1]`.
pub fn probability<R: Rng + ?Sized>(rng: &mut R, p: f64) -> bool {
    rng.gen::<f64>() < p
}

/// Pick a uniformly random element, or `None` for an empty slice.
pub fn pick<'a, T, R: Rng + ?Sized>(rng: &mut R, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    // usize keeps the draw at 64 bits: one draw per pick, even for one item.
    items.get(Uniform::new(0, items.len()).sample(rng))
}

/// Roll an integer in `[low, high]` (inclusive). Bounds may be given in any order.
pub fn range_inclusive<R: Rng + ?Sized>(rng: &mut R, low: u32, high: u32) -> u32 {
    let (low, high) = if low <= high { (low, high) } else { (high, low) };
    let value = Uniform::new_inclusive(u64::from(low), u64::from(high)).sample(rng);
    u32::try_from(value).unwrap_or(high)
}

/// Pick an index using integer weights.
///
/// Entries with zero weight are never selected. Returns `None` when every
/// weight is zero or the slice is empty.
pub fn weighted_index<R: Rng + ?Sized>(rng: &mut R, weights: &[u32]) -> Option<usize> {
    let distribution = WeightedIndex::<u64>::new(weights.iter().map(|w| u64::from(*w))).ok()?;
    Some(distribution.sample(rng))
}
