//! Recency-biased weighted selection.
//!
//! Buckets are chronological (oldest first). Bucket at position `i` weighs
//! `decay^i`; the newest bucket is further scaled by how far its still-running
//! year has progressed so a freshly started year does not dominate.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use rand::Rng;

use crate::error::IndexError;

pub const MIN_DECAY: f64 = 1.0;
pub const MAX_DECAY: f64 = 2.0;

/// Fraction of the calendar year containing `now` that has elapsed, in `[0, 1)`.
pub fn year_elapsed_fraction(now: NaiveDateTime) -> f64 {
    let year = now.year();
    let (Some(start), Some(end)) = (
        NaiveDate::from_ymd_opt(year, 1, 1).and_then(|day| day.and_hms_opt(0, 0, 0)),
        NaiveDate::from_ymd_opt(year + 1, 1, 1).and_then(|day| day.and_hms_opt(0, 0, 0)),
    ) else {
        return 0.0;
    };
    let total = (end - start).num_milliseconds() as f64;
    let elapsed = (now - start).num_milliseconds() as f64;
    if total <= 0.0 {
        return 0.0;
    }
    (elapsed / total).clamp(0.0, 1.0 - f64::EPSILON)
}

/// Weights for buckets at the given chronological `positions`.
///
/// Positions come from the unfiltered listing, so a dropped bucket leaves a
/// gap rather than promoting older ones. When `current_fraction` is set the
/// last bucket is the running period and is scaled by it.
pub fn bucket_weights(positions: &[usize], decay: f64, current_fraction: Option<f64>) -> Vec<f64> {
    let mut weights: Vec<f64> = positions
        .iter()
        .map(|position| decay.powi(*position as i32))
        .collect();
    if let (Some(last), Some(fraction)) = (weights.last_mut(), current_fraction) {
        *last *= fraction;
    }
    weights
}

/// Roulette-wheel draw: one uniform value in `[0, total)` against the
/// cumulative weights.
pub fn pick_weighted<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Result<usize, IndexError> {
    if weights.is_empty() {
        return Err(IndexError::EmptyIndex);
    }
    let total: f64 = weights.iter().filter(|weight| **weight > 0.0).sum();
    if !total.is_finite() || total <= 0.0 {
        return Err(IndexError::ZeroWeights);
    }

    let draw = rng.random_range(0.0..total);
    let mut cumulative = 0.0;
    let mut last_positive = 0;
    for (index, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        last_positive = index;
        if draw < cumulative {
            return Ok(index);
        }
    }
    // Rounding can leave `draw` a hair above the final cumulative sum.
    Ok(last_positive)
}

pub fn pick_uniform<'a, T, R: Rng + ?Sized>(items: &'a [T], rng: &mut R) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    items.get(rng.random_range(0..items.len()))
}
