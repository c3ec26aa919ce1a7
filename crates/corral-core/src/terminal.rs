use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::{Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TerminalSetError;
use crate::polytope::Polytope;
use crate::system::LinearSystem;

/// Hex characters kept from the request digest for cache file names.
const CACHE_KEY_LEN: usize = 20;

// ---------------------------------------------------------------------------
// TerminalSet
// ---------------------------------------------------------------------------

/// Robust invariant terminal ellipsoid with its stabilizing feedback.
///
/// The set is `{ x : (x - cx)' P (x - cx) <= alpha }` under the control law
/// `u = K (x - cx) + cu`. `P` and `K` come from an external oracle and are
/// persisted so repeated constructions skip synthesis entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSet {
    /// Ellipsoid shape matrix `P`, symmetric positive definite.
    pub shape: DMatrix<f64>,
    /// Feedback gain `K` applied inside the set.
    pub gain: DMatrix<f64>,
    /// State centroid `cx`.
    pub state_center: DVector<f64>,
    /// Input centroid `cu`.
    pub input_center: DVector<f64>,
}

impl TerminalSet {
    /// Check shapes, symmetry, and positive definiteness.
    pub fn validate(&self, state_dim: usize, input_dim: usize) -> Result<(), TerminalSetError> {
        if self.shape.shape() != (state_dim, state_dim) {
            return Err(TerminalSetError::Shape {
                field: "shape",
                rows: state_dim,
                cols: state_dim,
            });
        }
        if self.gain.shape() != (input_dim, state_dim) {
            return Err(TerminalSetError::Shape {
                field: "gain",
                rows: input_dim,
                cols: state_dim,
            });
        }
        if self.state_center.len() != state_dim {
            return Err(TerminalSetError::Shape {
                field: "state_center",
                rows: state_dim,
                cols: 1,
            });
        }
        if self.input_center.len() != input_dim {
            return Err(TerminalSetError::Shape {
                field: "input_center",
                rows: input_dim,
                cols: 1,
            });
        }

        for (field, ok) in [
            ("shape", self.shape.iter().all(|v| v.is_finite())),
            ("gain", self.gain.iter().all(|v| v.is_finite())),
            (
                "state_center",
                self.state_center.iter().all(|v| v.is_finite()),
            ),
            (
                "input_center",
                self.input_center.iter().all(|v| v.is_finite()),
            ),
        ] {
            if !ok {
                return Err(TerminalSetError::NonFinite { field });
            }
        }

        let scale = self.shape.amax().max(1.0);
        for i in 0..state_dim {
            for j in (i + 1)..state_dim {
                if (self.shape[(i, j)] - self.shape[(j, i)]).abs() > 1e-9 * scale {
                    return Err(TerminalSetError::NotSymmetric);
                }
            }
        }

        self.cholesky_lower().map(|_| ())
    }

    /// Lower Cholesky factor `L` with `P = L L'`.
    pub fn cholesky_lower(&self) -> Result<DMatrix<f64>, TerminalSetError> {
        Cholesky::new(self.shape.clone())
            .map(|c| c.l())
            .ok_or(TerminalSetError::NotPositiveDefinite)
    }

    /// Feedback law `u = K (x - cx) + cu`.
    pub fn feedback(&self, state: &DVector<f64>) -> DVector<f64> {
        &self.gain * (state - &self.state_center) + &self.input_center
    }
}

// ---------------------------------------------------------------------------
// TerminalSetRequest
// ---------------------------------------------------------------------------

/// Everything an oracle needs to synthesize a robust invariant set.
///
/// The vertex matrices enumerate the linearized dynamics over the parameter
/// box; the synthesized set must be invariant for every one of them.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalSetRequest {
    /// Continuous-time `A` matrices, one per vertex.
    pub a_set: Vec<DMatrix<f64>>,
    /// Continuous-time `B` matrices, matching `a_set` order.
    pub b_set: Vec<DMatrix<f64>>,
    /// State constraint polytope.
    pub state_polytope: Polytope,
    /// Input constraint polytope.
    pub input_polytope: Polytope,
    /// Discrete step in seconds the terminal feedback runs at.
    pub step: f64,
}

impl TerminalSetRequest {
    /// Assemble a request from vertex systems and the constraint polytopes.
    pub fn from_systems(
        systems: Vec<LinearSystem>,
        state_polytope: Polytope,
        input_polytope: Polytope,
        step: f64,
    ) -> Self {
        let mut a_set = Vec::with_capacity(systems.len());
        let mut b_set = Vec::with_capacity(systems.len());
        for system in systems {
            a_set.push(system.a);
            b_set.push(system.b);
        }
        Self {
            a_set,
            b_set,
            state_polytope,
            input_polytope,
            step,
        }
    }

    /// State dimension the request describes.
    pub fn state_dim(&self) -> usize {
        self.state_polytope.dim()
    }

    /// Input dimension the request describes.
    pub fn input_dim(&self) -> usize {
        self.input_polytope.dim()
    }

    /// Number of linearization vertices.
    pub fn vertices(&self) -> usize {
        self.a_set.len()
    }

    /// Content hash identifying this request in the cache.
    ///
    /// Covers every distinguishing field exactly once, with dimensions mixed
    /// in as framing so equal payloads of different shapes cannot collide.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hash_count(&mut hasher, self.a_set.len());
        for a in &self.a_set {
            hash_matrix(&mut hasher, a);
        }
        hash_count(&mut hasher, self.b_set.len());
        for b in &self.b_set {
            hash_matrix(&mut hasher, b);
        }
        hash_matrix(&mut hasher, &self.state_polytope.h);
        hash_vector(&mut hasher, &self.state_polytope.b);
        hash_matrix(&mut hasher, &self.input_polytope.h);
        hash_vector(&mut hasher, &self.input_polytope.b);
        hasher.update(self.step.to_le_bytes());

        let digest = hasher.finalize();
        let mut key = String::with_capacity(CACHE_KEY_LEN);
        for byte in digest.iter().take(CACHE_KEY_LEN / 2) {
            let _ = write!(key, "{byte:02x}");
        }
        key
    }
}

fn hash_count(hasher: &mut Sha256, count: usize) {
    hasher.update((count as u64).to_le_bytes());
}

fn hash_matrix(hasher: &mut Sha256, m: &DMatrix<f64>) {
    hash_count(hasher, m.nrows());
    hash_count(hasher, m.ncols());
    for v in m.iter() {
        hasher.update(v.to_le_bytes());
    }
}

fn hash_vector(hasher: &mut Sha256, v: &DVector<f64>) {
    hash_count(hasher, v.len());
    for x in v.iter() {
        hasher.update(x.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Oracle and cache
// ---------------------------------------------------------------------------

/// External synthesizer of robust invariant terminal sets.
///
/// Synthesis is expensive (typically an offline LMI or SDP computation), so
/// results are persisted keyed by the request hash and the oracle only runs
/// on a cache miss.
pub trait TerminalOracle {
    /// Produce a set valid for every vertex system in the request.
    fn synthesize(&self, request: &TerminalSetRequest) -> Result<TerminalSet, TerminalSetError>;

    /// Short name used in log lines.
    fn name(&self) -> &str {
        "oracle"
    }
}

/// Cache file path for a request key.
pub fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

/// Load the terminal set for `request` from `dir`, or synthesize and persist.
///
/// A present record is never re-synthesized; an unreadable or invalid record
/// is an error rather than a silent re-run.
pub fn obtain(
    request: &TerminalSetRequest,
    dir: &Path,
    oracle: &dyn TerminalOracle,
) -> Result<TerminalSet, TerminalSetError> {
    let state_dim = request.state_dim();
    let input_dim = request.input_dim();
    let key = request.cache_key();
    let path = cache_path(dir, &key);

    if path.exists() {
        log::debug!("terminal set cache hit: {}", path.display());
        let content = fs::read_to_string(&path)?;
        let set: TerminalSet = serde_json::from_str(&content)?;
        set.validate(state_dim, input_dim)?;
        return Ok(set);
    }

    log::info!(
        "terminal set cache miss for key {key}, running oracle '{}' over {} vertex systems",
        oracle.name(),
        request.vertices()
    );
    let set = oracle.synthesize(request)?;
    set.validate(state_dim, input_dim)?;

    fs::create_dir_all(dir)?;
    fs::write(&path, serde_json::to_string(&set)?)?;
    log::debug!("terminal set persisted: {}", path.display());
    Ok(set)
}
