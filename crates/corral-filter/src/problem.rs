//! Assembly of the per-round conic subproblem.
//!
//! The decision vector stacks the free initial state, then per stage the
//! input, successor state, and (when softening) the dynamics slack:
//!
//! `w = [X_0, U_0, X_1, e_0, U_1, X_2, e_1, ..., U_{N-1}, X_N, e_{N-1}]`
//!
//! Rows are grouped by cone for the backend: equalities first (initial pin,
//! then stage dynamics linearized at the current iterate), every polytope
//! and slew inequality next, and one second-order cone last that carries
//! the terminal ellipsoid exactly. Quadratic cost, polytopes, slew bounds,
//! and the terminal cone never change between rounds; only the dynamics
//! rows and the linear cost terms are rewritten.

use corral_core::config::{FilterConfig, ObjectiveMode, Weights};
use corral_core::error::CorralError;
use corral_core::polytope::Constraints;
use corral_core::system::Model;
use corral_core::terminal::TerminalSet;
use nalgebra::{DMatrix, DVector};

use crate::solver::ConicProblem;
use crate::step::{LinearizationPoint, Stepper};

/// Weight on squared dynamics slack when softening is enabled.
pub const SLACK_PENALTY: f64 = 1e10;

/// Factor applied to the deviation objective when softening is enabled, so
/// slack stays negligible against it at any reasonable weight scale.
pub const SOFTENED_DEVIATION_SCALE: f64 = 2.0;

/// Entries below this magnitude are dropped from constraint rows.
const COEFF_EPS: f64 = 1e-15;

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Index arithmetic over the stacked decision vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    state_dim: usize,
    input_dim: usize,
    horizon: usize,
    softening: bool,
}

impl Layout {
    pub const fn new(state_dim: usize, input_dim: usize, horizon: usize, softening: bool) -> Self {
        Self {
            state_dim,
            input_dim,
            horizon,
            softening,
        }
    }

    pub const fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub const fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub const fn horizon(&self) -> usize {
        self.horizon
    }

    pub const fn softening(&self) -> bool {
        self.softening
    }

    /// Entries added per stage.
    const fn stride(&self) -> usize {
        if self.softening {
            self.input_dim + 2 * self.state_dim
        } else {
            self.input_dim + self.state_dim
        }
    }

    /// Total decision vector length.
    pub const fn decision_len(&self) -> usize {
        self.state_dim + self.horizon * self.stride()
    }

    /// Offset of input `U_stage`, for `stage < horizon`.
    pub const fn input_offset(&self, stage: usize) -> usize {
        self.state_dim + stage * self.stride()
    }

    /// Offset of state `X_stage`, for `stage <= horizon`.
    pub const fn state_offset(&self, stage: usize) -> usize {
        if stage == 0 {
            0
        } else {
            self.input_offset(stage - 1) + self.input_dim
        }
    }

    /// Offset of slack `e_stage`; only meaningful when softening.
    pub fn slack_offset(&self, stage: usize) -> usize {
        debug_assert!(self.softening, "slack variables require softening");
        self.state_offset(stage + 1) + self.state_dim
    }
}

// ---------------------------------------------------------------------------
// RuntimeParams
// ---------------------------------------------------------------------------

/// Per-call quantities the subproblem is parameterized by.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeParams {
    /// Measured plant state pinning `X_0`.
    pub state: DVector<f64>,
    /// Candidate input the objective stays close to.
    pub candidate: DVector<f64>,
    /// Known-safe input seeding the warm-start rollout and anchoring the
    /// Taylor linearization.
    pub stabilizing: DVector<f64>,
    /// Previously applied input anchoring the first slew bound.
    pub previous: DVector<f64>,
    /// State reference for the tracking objective.
    pub state_reference: DVector<f64>,
    /// Exogenous parameter vector.
    pub exogenous: DVector<f64>,
}

// ---------------------------------------------------------------------------
// Problem
// ---------------------------------------------------------------------------

/// Once-built skeleton of the safety filter program.
///
/// Construction fixes every count, offset, and weight; [`Problem::conic`]
/// rewrites only what depends on the iterate and the runtime parameters.
pub struct Problem {
    layout: Layout,
    stepper: Stepper,
    constraints: Constraints,
    objective: ObjectiveMode,
    input_weight: DMatrix<f64>,
    state_weight: Option<DMatrix<f64>>,
    slew: Option<SlewBounds>,
    terminal: TerminalSet,
    /// Transposed Cholesky factor `L'` with `P = L L'`.
    terminal_factor_t: DMatrix<f64>,
    /// Precomputed `L' cx`.
    terminal_center_proj: DVector<f64>,
    margin_sqrt: f64,
    n_eq: usize,
    n_ineq: usize,
}

/// Absolute per-channel slew bounds, precomputed from rates.
#[derive(Debug, Clone, PartialEq)]
struct SlewBounds {
    /// Bound between the previously applied input and `U_0`, scaled by the
    /// command interval.
    first: DVector<f64>,
    /// Bound between consecutive predicted inputs, scaled by the stage step.
    stage: DVector<f64>,
}

impl Problem {
    /// Build the problem skeleton for a validated model and configuration.
    pub fn new<M: Model + ?Sized>(
        model: &M,
        constraints: Constraints,
        weights: &Weights,
        terminal: &TerminalSet,
        config: &FilterConfig,
    ) -> Result<Self, CorralError> {
        let nx = model.state_dim();
        let nu = model.input_dim();
        config.validate()?;
        weights.validate(nx, nu, &config.objective)?;
        terminal.validate(nx, nu)?;
        assert_eq!(constraints.state.dim(), nx, "State polytope dimension mismatch");
        assert_eq!(constraints.input.dim(), nu, "Input polytope dimension mismatch");

        let layout = Layout::new(nx, nu, config.horizon, config.softening);
        let stepper = Stepper::new(config.discretization, config.stage_dt());

        let factor = terminal.cholesky_lower().map_err(CorralError::Terminal)?;
        let terminal_factor_t = factor.transpose();
        let terminal_center_proj = &terminal_factor_t * &terminal.state_center;

        let slew = match &config.slew_rate {
            Some(rates) => {
                assert_eq!(rates.len(), nu, "Slew rate channel count mismatch");
                let first = DVector::from_iterator(
                    nu,
                    rates.iter().map(|r| r * config.command_interval),
                );
                let stage =
                    DVector::from_iterator(nu, rates.iter().map(|r| r * config.stage_dt()));
                Some(SlewBounds { first, stage })
            }
            None => None,
        };

        let slew_rows = if slew.is_some() {
            2 * nu * config.horizon
        } else {
            0
        };
        let n_eq = nx * (config.horizon + 1);
        let n_ineq =
            config.horizon * (constraints.input.faces() + constraints.state.faces()) + slew_rows;

        Ok(Self {
            layout,
            stepper,
            constraints,
            objective: config.objective,
            input_weight: weights.resolved_input(nu),
            state_weight: weights.state.clone(),
            slew,
            terminal: terminal.clone(),
            terminal_factor_t,
            terminal_center_proj,
            margin_sqrt: config.margin.sqrt(),
            n_eq,
            n_ineq,
        })
    }

    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    pub const fn stepper(&self) -> &Stepper {
        &self.stepper
    }

    pub const fn terminal(&self) -> &TerminalSet {
        &self.terminal
    }

    pub const fn equality_rows(&self) -> usize {
        self.n_eq
    }

    pub const fn inequality_rows(&self) -> usize {
        self.n_ineq
    }

    /// Stabilizing rollout that seeds the first solve.
    ///
    /// Input slots hold the stabilizing input; the state trail follows the
    /// terminal feedback applied from the measured state; slacks stay zero.
    pub fn initial_guess<M: Model + ?Sized>(
        &self,
        model: &M,
        state: &DVector<f64>,
        stabilizing: &DVector<f64>,
        exogenous: &DVector<f64>,
    ) -> DVector<f64> {
        let layout = self.layout;
        let nx = layout.state_dim;
        let nu = layout.input_dim;
        let mut guess = DVector::zeros(layout.decision_len());

        guess.rows_mut(layout.state_offset(0), nx).copy_from(state);
        let mut x = state.clone();
        for stage in 0..layout.horizon {
            guess
                .rows_mut(layout.input_offset(stage), nu)
                .copy_from(stabilizing);
            let u = self.terminal.feedback(&x);
            let lin = LinearizationPoint {
                state: x.clone(),
                input: u.clone(),
            };
            x = self.stepper.predict_vec(model, &x, &u, exogenous, &lin);
            guess
                .rows_mut(layout.state_offset(stage + 1), nx)
                .copy_from(&x);
        }
        guess
    }

    /// Assemble the conic subproblem around the current iterate.
    #[allow(clippy::too_many_lines)]
    pub fn conic<M: Model + ?Sized>(
        &self,
        model: &M,
        iterate: &DVector<f64>,
        params: &RuntimeParams,
    ) -> ConicProblem {
        let layout = self.layout;
        let nx = layout.state_dim;
        let nu = layout.input_dim;
        let horizon = layout.horizon;
        let n_dec = layout.decision_len();
        assert_eq!(iterate.len(), n_dec, "Iterate length mismatch");

        let n_soc = nx + 1;
        let n_rows = self.n_eq + self.n_ineq + n_soc;
        let mut a = DMatrix::zeros(n_rows, n_dec);
        let mut b = DVector::zeros(n_rows);

        // --- Initial state pin: X_0 = x ---
        for i in 0..nx {
            a[(i, layout.state_offset(0) + i)] = 1.0;
            b[i] = params.state[i];
        }
        let mut row = nx;

        // --- Stage dynamics linearized at the iterate ---
        // X_{i+1} - A_i X_i - B_i U_i (+ e_i) = F(Xk_i, Uk_i) - A_i Xk_i - B_i Uk_i
        let lin = LinearizationPoint {
            state: params.state.clone(),
            input: params.stabilizing.clone(),
        };
        for stage in 0..horizon {
            let x_off = layout.state_offset(stage);
            let u_off = layout.input_offset(stage);
            let x_next_off = layout.state_offset(stage + 1);

            let xk = iterate.rows(x_off, nx).into_owned();
            let uk = iterate.rows(u_off, nu).into_owned();
            let (a_d, b_d) = self
                .stepper
                .jacobians_at(model, &xk, &uk, &params.exogenous, &lin);
            let predicted = self
                .stepper
                .predict_vec(model, &xk, &uk, &params.exogenous, &lin);
            let residual = predicted - &a_d * &xk - &b_d * &uk;

            for i in 0..nx {
                a[(row + i, x_next_off + i)] = 1.0;
                for j in 0..nx {
                    let v = a_d[(i, j)];
                    if v.abs() > COEFF_EPS {
                        a[(row + i, x_off + j)] = -v;
                    }
                }
                for j in 0..nu {
                    let v = b_d[(i, j)];
                    if v.abs() > COEFF_EPS {
                        a[(row + i, u_off + j)] = -v;
                    }
                }
                if layout.softening {
                    a[(row + i, layout.slack_offset(stage) + i)] = 1.0;
                }
                b[row + i] = residual[i];
            }
            row += nx;
        }
        assert_eq!(row, self.n_eq, "Equality constraint count mismatch");

        // --- Input and state polytopes per stage ---
        for stage in 0..horizon {
            let u_off = layout.input_offset(stage);
            for face in 0..self.constraints.input.faces() {
                for j in 0..nu {
                    let v = self.constraints.input.h[(face, j)];
                    if v.abs() > COEFF_EPS {
                        a[(row, u_off + j)] = v;
                    }
                }
                b[row] = self.constraints.input.b[face];
                row += 1;
            }

            let x_next_off = layout.state_offset(stage + 1);
            for face in 0..self.constraints.state.faces() {
                for j in 0..nx {
                    let v = self.constraints.state.h[(face, j)];
                    if v.abs() > COEFF_EPS {
                        a[(row, x_next_off + j)] = v;
                    }
                }
                b[row] = self.constraints.state.b[face];
                row += 1;
            }
        }

        // --- Slew bounds ---
        if let Some(slew) = &self.slew {
            let u0 = layout.input_offset(0);
            for j in 0..nu {
                a[(row, u0 + j)] = 1.0;
                b[row] = params.previous[j] + slew.first[j];
                row += 1;
                a[(row, u0 + j)] = -1.0;
                b[row] = -params.previous[j] + slew.first[j];
                row += 1;
            }
            for stage in 0..horizon - 1 {
                let u_cur = layout.input_offset(stage);
                let u_next = layout.input_offset(stage + 1);
                for j in 0..nu {
                    a[(row, u_next + j)] = 1.0;
                    a[(row, u_cur + j)] = -1.0;
                    b[row] = slew.stage[j];
                    row += 1;
                    a[(row, u_next + j)] = -1.0;
                    a[(row, u_cur + j)] = 1.0;
                    b[row] = slew.stage[j];
                    row += 1;
                }
            }
        }
        assert_eq!(
            row,
            self.n_eq + self.n_ineq,
            "Inequality constraint count mismatch"
        );

        // --- Terminal ellipsoid as one second-order cone ---
        // || L' (X_N - cx) || <= sqrt(alpha), exact for the quadratic level set.
        b[row] = self.margin_sqrt;
        row += 1;
        let x_last = layout.state_offset(horizon);
        for i in 0..nx {
            for j in 0..nx {
                let v = self.terminal_factor_t[(i, j)];
                if v.abs() > COEFF_EPS {
                    a[(row + i, x_last + j)] = -v;
                }
            }
            b[row + i] = -self.terminal_center_proj[i];
        }
        row += nx;
        assert_eq!(row, n_rows, "Total constraint count mismatch");

        let (p, q) = self.cost(params);

        ConicProblem {
            p,
            q,
            a,
            b,
            n_eq: self.n_eq,
            n_ineq: self.n_ineq,
            soc_dims: vec![n_soc],
        }
    }

    /// Quadratic cost in `1/2 w' P w + q' w` form.
    fn cost(&self, params: &RuntimeParams) -> (DMatrix<f64>, DVector<f64>) {
        let layout = self.layout;
        let n_dec = layout.decision_len();
        let mut p = DMatrix::zeros(n_dec, n_dec);
        let mut q = DVector::zeros(n_dec);

        let scale = if layout.softening {
            SOFTENED_DEVIATION_SCALE
        } else {
            1.0
        };

        match self.objective {
            ObjectiveMode::MinimalCorrection => {
                self.add_input_deviation(&mut p, &mut q, 0, scale, &params.candidate);
            }
            ObjectiveMode::Tracking { track_input } => {
                for stage in 0..=layout.horizon {
                    self.add_state_deviation(&mut p, &mut q, stage, scale, &params.state_reference);
                }
                if track_input {
                    for stage in 0..layout.horizon {
                        self.add_input_deviation(&mut p, &mut q, stage, scale, &params.candidate);
                    }
                }
            }
        }

        if layout.softening {
            for stage in 0..layout.horizon {
                let e_off = layout.slack_offset(stage);
                for i in 0..layout.state_dim {
                    p[(e_off + i, e_off + i)] = 2.0 * SLACK_PENALTY;
                }
            }
        }

        (p, q)
    }

    /// Add `scale * (U_stage - target)' R (U_stage - target)` to the cost.
    fn add_input_deviation(
        &self,
        p: &mut DMatrix<f64>,
        q: &mut DVector<f64>,
        stage: usize,
        scale: f64,
        target: &DVector<f64>,
    ) {
        let off = self.layout.input_offset(stage);
        let nu = self.layout.input_dim;
        let weighted = &self.input_weight * target;
        for i in 0..nu {
            for j in 0..nu {
                let v = scale * self.input_weight[(i, j)];
                if v.abs() > COEFF_EPS {
                    p[(off + i, off + j)] += 2.0 * v;
                }
            }
            q[off + i] += -2.0 * scale * weighted[i];
        }
    }

    /// Add `scale * (X_stage - target)' Q (X_stage - target)` to the cost.
    fn add_state_deviation(
        &self,
        p: &mut DMatrix<f64>,
        q: &mut DVector<f64>,
        stage: usize,
        scale: f64,
        target: &DVector<f64>,
    ) {
        let weight = self
            .state_weight
            .as_ref()
            .expect("tracking weight checked at construction");
        let off = self.layout.state_offset(stage);
        let nx = self.layout.state_dim;
        let weighted = weight * target;
        for i in 0..nx {
            for j in 0..nx {
                let v = scale * weight[(i, j)];
                if v.abs() > COEFF_EPS {
                    p[(off + i, off + j)] += 2.0 * v;
                }
            }
            q[off + i] += -2.0 * scale * weighted[i];
        }
    }
}
