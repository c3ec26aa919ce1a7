//! Seeded randomness for reproducible tests and demos.
//!
//! Besides the bare RNG constructor this provides the two sequences the
//! closed-loop fixtures draw on: a reckless agent that commands anywhere in
//! the input range, and a gusty wind-speed profile.

use nalgebra::DVector;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Create a deterministic `ChaCha8Rng` from a seed.
///
/// All test randomization should go through this to ensure reproducibility.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Candidate inputs from an agent that ignores every limit.
///
/// Each cycle draws one value per channel uniformly from
/// `[-limits[j], limits[j]]`, the whole actuator range. Feeding these
/// through a filter exercises the correction path on nearly every cycle.
pub fn reckless_actions(limits: &[f64], cycles: usize, seed: u64) -> Vec<DVector<f64>> {
    let mut rng = seeded_rng(seed);
    (0..cycles)
        .map(|_| {
            DVector::from_iterator(
                limits.len(),
                limits.iter().map(|&lim| rng.gen_range(-lim..=lim)),
            )
        })
        .collect()
}

/// Wind speeds with a slow swell around `mean` plus per-cycle gusts,
/// clamped to `band`.
///
/// The swell period is a few hundred cycles, long against any horizon, so
/// consecutive calls see an almost constant but never frozen wind.
pub fn wind_profile(mean: f64, band: (f64, f64), cycles: usize, seed: u64) -> Vec<f64> {
    let mut rng = seeded_rng(seed);
    (0..cycles)
        .map(|cycle| {
            let swell = 2.5 * (0.05 * cycle as f64).sin();
            let gust: f64 = rng.gen_range(-0.4..0.4);
            (mean + swell + gust).clamp(band.0, band.1)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
