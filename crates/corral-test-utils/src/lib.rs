//! Shared test fixtures and utilities for corral crates.
//!
//! Provides reusable plant models, terminal set oracles, and deterministic
//! RNG setup so tests and demos agree on their fixtures.

pub mod oracle;
pub mod plants;
pub mod rng;

// ---------------------------------------------------------------------------
// Re-exports for convenience
// ---------------------------------------------------------------------------

pub use oracle::{CountingOracle, LqrOracle, StaticOracle};
pub use plants::{DoubleIntegrator, HarmonicOscillator, ScalarPlant, TurbinePlatform};
pub use rng::{reckless_actions, seeded_rng, wind_profile};
