//! Sequential conic solver for the safety filter program.
//!
//! Each round linearizes the dynamics at the current iterate and hands the
//! resulting conic program to Clarabel (pure Rust interior-point solver).
//! Equality rows sit in the zero cone, polytope and slew rows in the
//! nonnegative cone, and the terminal ellipsoid in one second-order cone,
//! so the terminal constraint holds exactly rather than linearized.
//!
//! Rounds stop once the iterate settles below the configured step
//! tolerance. Plants with affine dynamics rebuild the same subproblem
//! every round, so the second round certifies the first.

use std::time::Instant;

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{NonnegativeConeT, SecondOrderConeT, ZeroConeT},
};
use corral_core::config::{SolverBackend, SolverSettings};
use corral_core::error::SolveError;
use corral_core::system::Model;
use nalgebra::{DMatrix, DVector};

use crate::problem::{Problem, RuntimeParams};

// ---------------------------------------------------------------------------
// Conic backend
// ---------------------------------------------------------------------------

/// One conic program in `min 1/2 w' P w + q' w  s.t.  A w + s = b, s in K`
/// form, with cones ordered zero, nonnegative, then second-order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConicProblem {
    pub p: DMatrix<f64>,
    pub q: DVector<f64>,
    pub a: DMatrix<f64>,
    pub b: DVector<f64>,
    pub n_eq: usize,
    pub n_ineq: usize,
    pub soc_dims: Vec<usize>,
}

/// Primal solution of one conic subproblem.
#[derive(Debug, Clone, PartialEq)]
pub struct ConicSolution {
    pub x: DVector<f64>,
    pub status: String,
}

/// Numerical backend solving one conic subproblem per round.
pub trait ConicBackend {
    fn solve(&self, problem: &ConicProblem) -> Result<ConicSolution, SolveError>;

    fn name(&self) -> &str {
        "backend"
    }
}

/// Clarabel interior-point backend.
pub struct ClarabelBackend {
    max_iter: u32,
    tol: f64,
    verbose: bool,
}

impl ClarabelBackend {
    pub const fn new(settings: &SolverSettings) -> Self {
        Self {
            max_iter: settings.max_iter,
            tol: settings.tol,
            verbose: settings.verbose,
        }
    }
}

impl ConicBackend for ClarabelBackend {
    fn solve(&self, problem: &ConicProblem) -> Result<ConicSolution, SolveError> {
        let n_soc: usize = problem.soc_dims.iter().sum();
        assert_eq!(
            problem.a.nrows(),
            problem.n_eq + problem.n_ineq + n_soc,
            "Constraint row count mismatch"
        );
        assert_eq!(problem.b.len(), problem.a.nrows(), "Offset length mismatch");

        let p_csc = dmatrix_to_csc_upper_tri(&problem.p);
        let a_csc = dmatrix_to_csc(&problem.a);

        let mut cones = Vec::new();
        if problem.n_eq > 0 {
            cones.push(ZeroConeT(problem.n_eq));
        }
        if problem.n_ineq > 0 {
            cones.push(NonnegativeConeT(problem.n_ineq));
        }
        for &dim in &problem.soc_dims {
            cones.push(SecondOrderConeT(dim));
        }

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.max_iter)
            .verbose(self.verbose)
            .tol_gap_abs(self.tol)
            .tol_gap_rel(self.tol)
            .tol_feas(self.tol)
            .build()
            .expect("valid solver settings");

        let q_slice: Vec<f64> = problem.q.iter().copied().collect();
        let b_slice: Vec<f64> = problem.b.iter().copied().collect();

        match DefaultSolver::new(&p_csc, &q_slice, &a_csc, &b_slice, &cones, settings) {
            Ok(mut solver) => {
                solver.solve();
                let sol = &solver.solution;
                let status = format!("{:?}", sol.status);
                if matches!(
                    sol.status,
                    SolverStatus::Solved | SolverStatus::AlmostSolved
                ) {
                    Ok(ConicSolution {
                        x: DVector::from_column_slice(&sol.x),
                        status,
                    })
                } else {
                    Err(SolveError::NotConverged { status })
                }
            }
            Err(_) => Err(SolveError::ProblemSetup),
        }
    }

    fn name(&self) -> &str {
        "interior_point"
    }
}

// ---------------------------------------------------------------------------
// Relinearization loop
// ---------------------------------------------------------------------------

/// Converged decision vector plus convergence info.
#[derive(Debug, Clone, PartialEq)]
pub struct NlpSolution {
    /// Full stacked decision vector at the settled iterate.
    pub decision: DVector<f64>,
    /// Relinearization rounds spent, including the certifying one.
    pub rounds: usize,
    pub solve_time_us: u64,
}

/// Drives [`Problem::conic`] to a fixed point, carrying the previous
/// solution across calls as a warm start.
pub struct NlpSolver {
    backend: Box<dyn ConicBackend>,
    step_tol: f64,
    max_rounds: usize,
    init_guess: Option<DVector<f64>>,
}

impl NlpSolver {
    pub fn new(settings: &SolverSettings) -> Self {
        let backend: Box<dyn ConicBackend> = match settings.backend {
            SolverBackend::InteriorPoint => Box::new(ClarabelBackend::new(settings)),
            SolverBackend::Qp(never) => match never {},
        };
        log::debug!("Conic backend: {}", backend.name());
        Self {
            backend,
            step_tol: settings.step_tol,
            max_rounds: settings.max_rounds,
            init_guess: None,
        }
    }

    /// Iterate gets seeded from the stored warm start, falling back to the
    /// stabilizing rollout on the first call.
    pub fn init_guess(&self) -> Option<&DVector<f64>> {
        self.init_guess.as_ref()
    }

    /// Drop the stored warm start; the next call reseeds from the rollout.
    pub fn reset(&mut self) {
        self.init_guess = None;
    }

    /// Solve the program by relinearizing until the iterate settles.
    ///
    /// With `discard` set the converged iterate is not stored, so the next
    /// call warm-starts from the same point this one did.
    pub fn solve<M: Model + ?Sized>(
        &mut self,
        problem: &Problem,
        model: &M,
        params: &RuntimeParams,
        discard: bool,
    ) -> Result<NlpSolution, SolveError> {
        let start = Instant::now();

        let mut iterate = match &self.init_guess {
            Some(guess) => {
                assert_eq!(
                    guess.len(),
                    problem.layout().decision_len(),
                    "Warm start length mismatch"
                );
                guess.clone()
            }
            None => {
                let guess = problem.initial_guess(
                    model,
                    &params.state,
                    &params.stabilizing,
                    &params.exogenous,
                );
                self.init_guess = Some(guess.clone());
                guess
            }
        };

        let mut rounds = 0;
        loop {
            let conic = problem.conic(model, &iterate, params);
            let solution = self.backend.solve(&conic)?;
            rounds += 1;

            let step = (&solution.x - &iterate).amax();
            log::debug!(
                "Round {rounds}: step {step:.3e}, backend status {}",
                solution.status
            );
            iterate = solution.x;

            if step <= self.step_tol {
                break;
            }
            if rounds >= self.max_rounds {
                return Err(SolveError::IterationLimit {
                    limit: self.max_rounds,
                });
            }
        }

        if !discard {
            self.init_guess = Some(iterate.clone());
        }

        let elapsed = start.elapsed();
        Ok(NlpSolution {
            decision: iterate,
            rounds,
            solve_time_us: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        })
    }
}

// ---------------------------------------------------------------------------
// CSC conversion
// ---------------------------------------------------------------------------

/// Convert a nalgebra `DMatrix<f64>` to a Clarabel `CscMatrix<f64>` (full matrix).
fn dmatrix_to_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v.abs() > 1e-15 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Convert a symmetric nalgebra `DMatrix<f64>` to upper-triangular `CscMatrix<f64>`.
fn dmatrix_to_csc_upper_tri(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..=j.min(nrows - 1) {
            let v = m[(i, j)];
            if v.abs() > 1e-15 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use corral_core::config::{FilterConfig, Weights};
    use corral_core::polytope::{Constraints, Polytope};
    use corral_core::terminal::TerminalSet;
    use corral_test_utils::plants::ScalarPlant;
    use nalgebra::{dmatrix, dvector};

    // ---- CSC conversion tests ----

    #[test]
    fn full_csc_drops_zeros_column_major() {
        let m = dmatrix![1.0, 0.0; 0.0, 3.0; 2.0, 0.0];
        let csc = dmatrix_to_csc(&m);
        assert_eq!(csc.colptr, vec![0, 2, 3]);
        assert_eq!(csc.rowval, vec![0, 2, 1]);
        assert_eq!(csc.nzval, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn upper_tri_csc_keeps_the_upper_triangle() {
        let m = dmatrix![2.0, 1.0; 1.0, 4.0];
        let csc = dmatrix_to_csc_upper_tri(&m);
        assert_eq!(csc.colptr, vec![0, 1, 3]);
        assert_eq!(csc.rowval, vec![0, 0, 1]);
        assert_eq!(csc.nzval, vec![2.0, 1.0, 4.0]);
    }

    // ---- Backend tests ----

    fn backend() -> ClarabelBackend {
        ClarabelBackend::new(&SolverSettings::default())
    }

    #[test]
    fn backend_solves_a_bound_constrained_quadratic() {
        // min (x - 2)^2 subject to x <= 1; optimum sits on the bound.
        let problem = ConicProblem {
            p: dmatrix![2.0],
            q: dvector![-4.0],
            a: dmatrix![1.0],
            b: dvector![1.0],
            n_eq: 0,
            n_ineq: 1,
            soc_dims: Vec::new(),
        };
        let solution = backend().solve(&problem).unwrap();
        assert_relative_eq!(solution.x[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn backend_reports_infeasible_programs() {
        // 0 * x = 1 cannot hold.
        let problem = ConicProblem {
            p: dmatrix![2.0],
            q: dvector![0.0],
            a: dmatrix![0.0],
            b: dvector![1.0],
            n_eq: 1,
            n_ineq: 0,
            soc_dims: Vec::new(),
        };
        let result = backend().solve(&problem);
        assert!(matches!(result, Err(SolveError::NotConverged { .. })));
    }

    #[test]
    fn backend_honors_second_order_cones() {
        // min x subject to |x| <= 2, written as the cone (2, x).
        let problem = ConicProblem {
            p: DMatrix::zeros(1, 1),
            q: dvector![1.0],
            a: dmatrix![0.0; -1.0],
            b: dvector![2.0, 0.0],
            n_eq: 0,
            n_ineq: 0,
            soc_dims: vec![2],
        };
        let solution = backend().solve(&problem).unwrap();
        assert_relative_eq!(solution.x[0], -2.0, epsilon = 1e-6);
    }

    // ---- Relinearization loop tests ----

    fn scalar_problem() -> Problem {
        let terminal = TerminalSet {
            shape: dmatrix![4.0],
            gain: dmatrix![0.0],
            state_center: dvector![0.0],
            input_center: dvector![0.0],
        };
        let constraints = Constraints::new(
            Polytope::symmetric_box(&[1.0]).unwrap(),
            Polytope::symmetric_box(&[1.0]).unwrap(),
        );
        let config = FilterConfig {
            horizon: 3,
            duration: 3.0,
            softening: false,
            ..FilterConfig::default()
        };
        Problem::new(&ScalarPlant, constraints, &Weights::default(), &terminal, &config).unwrap()
    }

    fn scalar_params() -> RuntimeParams {
        RuntimeParams {
            state: dvector![0.2],
            candidate: dvector![0.8],
            stabilizing: dvector![0.0],
            previous: dvector![0.0],
            state_reference: dvector![0.0],
            exogenous: DVector::zeros(0),
        }
    }

    #[test]
    fn affine_plant_certifies_on_the_second_round() {
        let problem = scalar_problem();
        let mut solver = NlpSolver::new(&SolverSettings::default());
        let solution = solver.solve(&problem, &ScalarPlant, &scalar_params(), false).unwrap();

        // Affine dynamics rebuild the same subproblem, so round two takes a
        // zero step and certifies round one.
        assert_eq!(solution.rounds, 2);

        // The candidate is already safe here; the first input passes through.
        let u0 = problem.layout().input_offset(0);
        assert_relative_eq!(solution.decision[u0], 0.8, epsilon = 1e-4);
    }

    #[test]
    fn stored_solution_warm_starts_the_next_call() {
        let problem = scalar_problem();
        let params = scalar_params();
        let mut solver = NlpSolver::new(&SolverSettings::default());

        let first = solver.solve(&problem, &ScalarPlant, &params, false).unwrap();
        assert_eq!(first.rounds, 2);

        // Warm-started from the converged iterate the first round already
        // takes a zero step.
        let second = solver.solve(&problem, &ScalarPlant, &params, false).unwrap();
        assert_eq!(second.rounds, 1);
    }

    #[test]
    fn discard_keeps_the_rollout_as_warm_start() {
        let problem = scalar_problem();
        let params = scalar_params();
        let mut solver = NlpSolver::new(&SolverSettings::default());

        let first = solver.solve(&problem, &ScalarPlant, &params, true).unwrap();
        assert_eq!(first.rounds, 2);

        // The rollout generated on the first call was stored, the converged
        // iterate was not, so the next call repeats the full two rounds.
        let second = solver.solve(&problem, &ScalarPlant, &params, false).unwrap();
        assert_eq!(second.rounds, 2);

        let third = solver.solve(&problem, &ScalarPlant, &params, false).unwrap();
        assert_eq!(third.rounds, 1);
    }

    #[test]
    fn reset_reseeds_from_the_rollout() {
        let problem = scalar_problem();
        let params = scalar_params();
        let mut solver = NlpSolver::new(&SolverSettings::default());

        solver.solve(&problem, &ScalarPlant, &params, false).unwrap();
        assert!(solver.init_guess().is_some());

        solver.reset();
        assert!(solver.init_guess().is_none());
        let again = solver.solve(&problem, &ScalarPlant, &params, false).unwrap();
        assert_eq!(again.rounds, 2);
    }

    #[test]
    fn round_cap_aborts_before_settling() {
        let problem = scalar_problem();
        let settings = SolverSettings {
            max_rounds: 1,
            ..SolverSettings::default()
        };
        let mut solver = NlpSolver::new(&settings);
        let result = solver.solve(&problem, &ScalarPlant, &scalar_params(), false);
        assert!(matches!(result, Err(SolveError::IterationLimit { limit: 1 })));
    }
}
