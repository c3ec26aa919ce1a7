use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Polytope
// ---------------------------------------------------------------------------

/// Convex polytope `{ z : H z <= b }` over states or inputs.
///
/// Every row of `h` is one half-space; `b` holds the matching offsets. The
/// filter keeps these rows linear in the conic subproblem, so membership is
/// enforced exactly at every predicted stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polytope {
    /// Half-space normals, one row per face.
    pub h: DMatrix<f64>,
    /// Half-space offsets, one entry per face.
    pub b: DVector<f64>,
}

impl Polytope {
    /// Build a polytope from half-space rows, checking shape agreement.
    pub fn new(h: DMatrix<f64>, b: DVector<f64>) -> Result<Self, ConfigError> {
        if h.nrows() == 0 || h.ncols() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "polytope".into(),
                message: "half-space matrix must be non-empty".into(),
            });
        }
        if h.nrows() != b.len() {
            return Err(ConfigError::InvalidValue {
                field: "polytope".into(),
                message: format!("{} rows but {} offsets", h.nrows(), b.len()),
            });
        }
        if h.iter().any(|v| !v.is_finite()) || b.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidValue {
                field: "polytope".into(),
                message: "half-space entries must be finite".into(),
            });
        }
        Ok(Self { h, b })
    }

    /// Symmetric box `|z_i| <= half_widths[i]` as stacked `[I; -I]` rows.
    pub fn symmetric_box(half_widths: &[f64]) -> Result<Self, ConfigError> {
        let n = half_widths.len();
        let mut h = DMatrix::zeros(2 * n, n);
        let mut b = DVector::zeros(2 * n);
        for (i, &w) in half_widths.iter().enumerate() {
            h[(i, i)] = 1.0;
            h[(n + i, i)] = -1.0;
            b[i] = w;
            b[n + i] = w;
        }
        Self::new(h, b)
    }

    /// Space dimension the polytope lives in.
    pub fn dim(&self) -> usize {
        self.h.ncols()
    }

    /// Number of half-space rows.
    pub fn faces(&self) -> usize {
        self.h.nrows()
    }

    /// Largest positive constraint violation of `z`, zero when inside.
    pub fn violation(&self, z: &DVector<f64>) -> f64 {
        let residual = &self.h * z - &self.b;
        residual.iter().fold(0.0_f64, |acc, &r| acc.max(r))
    }

    /// Whether `z` satisfies every half-space.
    pub fn contains(&self, z: &DVector<f64>) -> bool {
        self.violation(z) <= 0.0
    }
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// State and input constraint polytopes the filter enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub state: Polytope,
    pub input: Polytope,
}

impl Constraints {
    pub const fn new(state: Polytope, input: Polytope) -> Self {
        Self { state, input }
    }
}
