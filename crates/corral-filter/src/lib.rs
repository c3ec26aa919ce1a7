//! Predictive safety filter over conic optimization.
//!
//! The filter takes a candidate input each cycle and returns the closest
//! input, under a weighted norm, for which a feasible trajectory exists:
//!
//! 1. **Vertex enumeration** — linearizes the plant at every corner of the
//!    declared parameter box
//! 2. **Terminal set** — an invariant ellipsoid with a stabilizing feedback,
//!    synthesized once per request and cached on disk
//! 3. **Problem assembly** — polytope, slew, and terminal constraints over
//!    a stacked input/state/slack decision vector
//! 4. **Relinearized solve** — repeated conic programs (Clarabel) with the
//!    dynamics linearized at the previous iterate, warm-started across
//!    cycles
//!
//! # Architecture
//!
//! The terminal ellipsoid enters each subproblem as a second-order cone, so
//! only the dynamics rows change between rounds. Plants with affine
//! dynamics therefore converge in exactly two rounds, the second one
//! certifying a zero step.

pub mod filter;
pub mod problem;
pub mod solver;
pub mod step;
pub mod system_set;

pub use filter::{CalcOptions, Correction, SafetyFilter};
pub use problem::{Layout, Problem, RuntimeParams, SLACK_PENALTY, SOFTENED_DEVIATION_SCALE};
pub use solver::{ClarabelBackend, ConicBackend, ConicProblem, ConicSolution, NlpSolution, NlpSolver};
pub use step::{LinearizationPoint, Stepper};
pub use system_set::{vertex_systems, MAX_VERTEX_VARIABLES};
