//! Terminal set oracles for tests and demos.
//!
//! [`LqrOracle`] is a real synthesis path: it solves a discrete Riccati
//! equation for the mean vertex system and scales the resulting ellipsoid
//! until it respects the polytopes. [`StaticOracle`] and [`CountingOracle`]
//! exist to pin down caching behavior.

use std::cell::Cell;

use corral_core::error::TerminalSetError;
use corral_core::terminal::{TerminalOracle, TerminalSet, TerminalSetRequest};
use nalgebra::{DMatrix, DVector};

const RICCATI_MAX_ITERS: usize = 500;
const RICCATI_TOL: f64 = 1e-10;
/// Polytope rows whose ellipsoid radius falls below this are unbounded in
/// the row direction and skipped.
const DEGENERATE_ROW: f64 = 1e-12;

// ---------------------------------------------------------------------------
// LqrOracle
// ---------------------------------------------------------------------------

/// Synthesizes a terminal set from an infinite-horizon LQR design.
///
/// The Riccati solution `P` of the mean vertex system gives both the
/// quadratic level sets and the feedback gain. The returned shape is `P`
/// scaled so the unit level set fits inside the state polytope and maps
/// into the input polytope under the gain; the configured margin then
/// shrinks it further at solve time.
pub struct LqrOracle {
    pub state_cost: DMatrix<f64>,
    pub input_cost: DMatrix<f64>,
}

impl LqrOracle {
    pub const fn new(state_cost: DMatrix<f64>, input_cost: DMatrix<f64>) -> Self {
        Self {
            state_cost,
            input_cost,
        }
    }
}

impl TerminalOracle for LqrOracle {
    fn synthesize(&self, request: &TerminalSetRequest) -> Result<TerminalSet, TerminalSetError> {
        let nx = request.state_dim();
        let nu = request.input_dim();
        if request.vertices() == 0 {
            return Err(TerminalSetError::Synthesis(
                "Request carries no vertex systems".to_string(),
            ));
        }
        if self.state_cost.shape() != (nx, nx) {
            return Err(TerminalSetError::Synthesis(format!(
                "State cost is {}x{} for a plant with {nx} states",
                self.state_cost.nrows(),
                self.state_cost.ncols()
            )));
        }
        if self.input_cost.shape() != (nu, nu) {
            return Err(TerminalSetError::Synthesis(format!(
                "Input cost is {}x{} for a plant with {nu} inputs",
                self.input_cost.nrows(),
                self.input_cost.ncols()
            )));
        }

        let mut a_mean = DMatrix::zeros(nx, nx);
        let mut b_mean = DMatrix::zeros(nx, nu);
        for a in &request.a_set {
            a_mean += a;
        }
        for b in &request.b_set {
            b_mean += b;
        }
        let count = request.vertices() as f64;
        a_mean /= count;
        b_mean /= count;

        let (a_d, b_d) = discretize(&a_mean, &b_mean, request.step);
        let (shape_unscaled, gain) = riccati(&a_d, &b_d, &self.state_cost, &self.input_cost)?;

        let scale = admissible_scale(&shape_unscaled, &gain, request)?;
        let shape = shape_unscaled / scale;

        Ok(TerminalSet {
            shape,
            gain,
            state_center: DVector::zeros(nx),
            input_center: DVector::zeros(nu),
        })
    }

    fn name(&self) -> &str {
        "lqr"
    }
}

/// Iterate the discrete Riccati equation to its fixed point.
///
/// Returns `(P, K)` with the feedback written as `u = K x`.
fn riccati(
    a_d: &DMatrix<f64>,
    b_d: &DMatrix<f64>,
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> Result<(DMatrix<f64>, DMatrix<f64>), TerminalSetError> {
    let mut p = q.clone();
    let mut settled = false;
    for _ in 0..RICCATI_MAX_ITERS {
        let btp = b_d.transpose() * &p;
        let gram = r + &btp * b_d;
        let gram_inv = gram.try_inverse().ok_or_else(|| {
            TerminalSetError::Synthesis("Input cost plus B'PB is singular".to_string())
        })?;
        let btpa = &btp * a_d;
        let next = q + a_d.transpose() * &p * a_d
            - a_d.transpose() * &p * b_d * &gram_inv * &btpa;

        let delta = (&next - &p).amax();
        p = next;
        if delta < RICCATI_TOL {
            settled = true;
            break;
        }
    }
    if !settled {
        return Err(TerminalSetError::Synthesis(format!(
            "Riccati iteration did not settle within {RICCATI_MAX_ITERS} sweeps"
        )));
    }

    let btp = b_d.transpose() * &p;
    let gram = r + &btp * b_d;
    let gram_inv = gram.try_inverse().ok_or_else(|| {
        TerminalSetError::Synthesis("Input cost plus B'PB is singular".to_string())
    })?;
    let gain = -(&gram_inv * &btp * a_d);
    Ok((p, gain))
}

/// Largest `s` such that `{x : x' P x <= s}` stays inside the state
/// polytope and maps into the input polytope under the gain.
fn admissible_scale(
    p: &DMatrix<f64>,
    gain: &DMatrix<f64>,
    request: &TerminalSetRequest,
) -> Result<f64, TerminalSetError> {
    let p_inv = p.clone().try_inverse().ok_or_else(|| {
        TerminalSetError::Synthesis("Riccati solution is singular".to_string())
    })?;

    let mut scale = f64::INFINITY;
    let mut tighten = |h: DVector<f64>, offset: f64, what: &str| {
        let radius_sq = (h.transpose() * &p_inv * &h)[(0, 0)];
        if radius_sq <= DEGENERATE_ROW {
            return Ok(());
        }
        if offset <= 0.0 {
            return Err(TerminalSetError::Synthesis(format!(
                "{what} polytope does not contain the origin"
            )));
        }
        scale = scale.min(offset * offset / radius_sq);
        Ok(())
    };

    for j in 0..request.state_polytope.faces() {
        let h = request.state_polytope.h.row(j).transpose();
        tighten(h, request.state_polytope.b[j], "State")?;
    }
    for j in 0..request.input_polytope.faces() {
        let h = (request.input_polytope.h.row(j) * gain).transpose();
        tighten(h, request.input_polytope.b[j], "Input")?;
    }

    if !(scale.is_finite() && scale > 0.0) {
        return Err(TerminalSetError::Synthesis(
            "No polytope row bounds the terminal ellipsoid".to_string(),
        ));
    }
    Ok(scale)
}

/// Discretize `(A, B)` with the augmented matrix exponential:
///
/// ```text
/// [A_d  B_d] = expm(dt * [A  B])
/// [ 0    I ]             [0  0]
/// ```
fn discretize(a_c: &DMatrix<f64>, b_c: &DMatrix<f64>, dt: f64) -> (DMatrix<f64>, DMatrix<f64>) {
    let n_x = a_c.nrows();
    let n_u = b_c.ncols();
    let n_aug = n_x + n_u;

    let mut aug = DMatrix::zeros(n_aug, n_aug);
    aug.view_mut((0, 0), (n_x, n_x)).copy_from(a_c);
    aug.view_mut((0, n_x), (n_x, n_u)).copy_from(b_c);
    aug *= dt;

    let exp_aug = matrix_exp(&aug);

    let a_d = exp_aug.view((0, 0), (n_x, n_x)).clone_owned();
    let b_d = exp_aug.view((0, n_x), (n_x, n_u)).clone_owned();

    (a_d, b_d)
}

/// Matrix exponential by scaling-and-squaring with a Taylor series.
fn matrix_exp(m: &DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();

    let norm_inf = m
        .row_iter()
        .map(|row| row.iter().map(|x| x.abs()).sum::<f64>())
        .fold(0.0_f64, f64::max);

    let s = if norm_inf > 1.0 {
        (norm_inf.log2().ceil() as u32).max(1)
    } else {
        0
    };

    let m_scaled = if s > 0 {
        m / f64::from(2u32.pow(s))
    } else {
        m.clone()
    };

    let mut result = DMatrix::identity(n, n);
    let mut term = DMatrix::identity(n, n);

    for k in 1..=13 {
        term = &term * &m_scaled / (k as f64);
        result += &term;
        let term_norm = term.iter().map(|x| x.abs()).fold(0.0_f64, f64::max);
        if term_norm < 1e-16 {
            break;
        }
    }

    for _ in 0..s {
        result = &result * &result;
    }

    result
}

// ---------------------------------------------------------------------------
// StaticOracle
// ---------------------------------------------------------------------------

/// Returns a fixed set regardless of the request.
pub struct StaticOracle {
    set: TerminalSet,
}

impl StaticOracle {
    pub const fn new(set: TerminalSet) -> Self {
        Self { set }
    }
}

impl TerminalOracle for StaticOracle {
    fn synthesize(&self, _request: &TerminalSetRequest) -> Result<TerminalSet, TerminalSetError> {
        Ok(self.set.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

// ---------------------------------------------------------------------------
// CountingOracle
// ---------------------------------------------------------------------------

/// Wraps another oracle and counts synthesis calls, for cache assertions.
pub struct CountingOracle<O> {
    inner: O,
    calls: Cell<usize>,
}

impl<O: TerminalOracle> CountingOracle<O> {
    pub const fn new(inner: O) -> Self {
        Self {
            inner,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl<O: TerminalOracle> TerminalOracle for CountingOracle<O> {
    fn synthesize(&self, request: &TerminalSetRequest) -> Result<TerminalSet, TerminalSetError> {
        self.calls.set(self.calls.get() + 1);
        self.inner.synthesize(request)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
