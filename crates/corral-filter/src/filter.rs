//! The safety filter itself.
//!
//! [`SafetyFilter`] owns the plant model, the problem skeleton, the terminal
//! set, and the warm-started solver. Construction runs the full setup chain
//! (vertex enumeration, terminal set synthesis or cache load, problem
//! assembly); [`SafetyFilter::calc`] then corrects one candidate input per
//! command interval.

use corral_core::config::{FilterConfig, ParameterBounds, Weights};
use corral_core::error::{ConfigError, CorralError, ValidationError};
use corral_core::polytope::Constraints;
use corral_core::system::Model;
use corral_core::terminal::{self, TerminalOracle, TerminalSet, TerminalSetRequest};
use nalgebra::DVector;

use crate::problem::{Problem, RuntimeParams};
use crate::solver::NlpSolver;
use crate::system_set::vertex_systems;

/// Per-call options for [`SafetyFilter::calc`].
#[derive(Debug, Clone, Default)]
pub struct CalcOptions {
    /// Input applied on the previous cycle, anchoring the first slew bound.
    /// Required whenever slew rate limits are configured.
    pub previous_input: Option<DVector<f64>>,
    /// Reference for the tracking objective. Falls back to the origin.
    pub state_reference: Option<DVector<f64>>,
    /// Solve without storing the converged iterate, so the next call
    /// warm-starts from the same point this one did.
    pub discard_solution: bool,
}

/// Filtered input plus convergence info for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    /// Input to apply for the next command interval.
    pub action: DVector<f64>,
    /// Relinearization rounds spent, including the certifying one.
    pub rounds: usize,
    pub solve_time_us: u64,
}

/// Predictive safety filter over a plant model.
pub struct SafetyFilter<M: Model> {
    model: M,
    problem: Problem,
    solver: NlpSolver,
    config: FilterConfig,
}

impl<M: Model> SafetyFilter<M> {
    /// Build the filter, synthesizing or loading the terminal set.
    ///
    /// `bounds` gives the interval for every declared linearization
    /// variable; the terminal set is requested for the resulting vertex
    /// systems and cached under the configured directory.
    pub fn new(
        model: M,
        constraints: Constraints,
        bounds: &ParameterBounds,
        weights: &Weights,
        config: FilterConfig,
        oracle: &dyn TerminalOracle,
    ) -> Result<Self, CorralError> {
        config.validate()?;
        let nx = model.state_dim();
        let nu = model.input_dim();

        if constraints.state.dim() != nx {
            return Err(ConfigError::InvalidValue {
                field: "constraints.state".into(),
                message: format!(
                    "dimension {} does not match the plant state ({nx})",
                    constraints.state.dim()
                ),
            }
            .into());
        }
        if constraints.input.dim() != nu {
            return Err(ConfigError::InvalidValue {
                field: "constraints.input".into(),
                message: format!(
                    "dimension {} does not match the plant input ({nu})",
                    constraints.input.dim()
                ),
            }
            .into());
        }
        if let Some(rates) = &config.slew_rate {
            if rates.len() != nu {
                return Err(ConfigError::InvalidValue {
                    field: "slew_rate".into(),
                    message: format!("{} channels for a plant with {nu} inputs", rates.len()),
                }
                .into());
            }
        }

        let systems = vertex_systems(&model, bounds)?;
        let request = TerminalSetRequest::from_systems(
            systems,
            constraints.state.clone(),
            constraints.input.clone(),
            config.command_interval,
        );
        let terminal = terminal::obtain(&request, &config.cache_dir, oracle)?;

        let problem = Problem::new(&model, constraints, weights, &terminal, &config)?;
        let solver = NlpSolver::new(&config.solver);

        Ok(Self {
            model,
            problem,
            solver,
            config,
        })
    }

    pub const fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub const fn model(&self) -> &M {
        &self.model
    }

    /// Terminal set the filter steers into by the end of the horizon.
    pub const fn terminal_set(&self) -> &TerminalSet {
        self.problem.terminal()
    }

    /// Drop the stored warm start, as after a plant reset or a state jump.
    pub fn reset_init_guess(&mut self) {
        self.solver.reset();
    }

    /// Correct one candidate input.
    ///
    /// `stabilizing` is a known-safe input for the current state; it seeds
    /// the warm-start rollout and anchors the Taylor linearization.
    pub fn calc(
        &mut self,
        state: &DVector<f64>,
        candidate: &DVector<f64>,
        stabilizing: &DVector<f64>,
        exogenous: &DVector<f64>,
        options: &CalcOptions,
    ) -> Result<Correction, CorralError> {
        self.check_runtime(state, candidate, stabilizing, exogenous, options)?;

        let previous = options
            .previous_input
            .clone()
            .unwrap_or_else(|| candidate.clone());
        let state_reference = options
            .state_reference
            .clone()
            .unwrap_or_else(|| DVector::zeros(self.model.state_dim()));

        let params = RuntimeParams {
            state: state.clone(),
            candidate: candidate.clone(),
            stabilizing: stabilizing.clone(),
            previous,
            state_reference,
            exogenous: exogenous.clone(),
        };

        let solution =
            self.solver
                .solve(&self.problem, &self.model, &params, options.discard_solution)?;

        let layout = self.problem.layout();
        let action = solution
            .decision
            .rows(layout.input_offset(0), layout.input_dim())
            .into_owned();
        log::debug!(
            "Filtered action in {} rounds ({} us)",
            solution.rounds,
            solution.solve_time_us
        );

        Ok(Correction {
            action,
            rounds: solution.rounds,
            solve_time_us: solution.solve_time_us,
        })
    }

    fn check_runtime(
        &self,
        state: &DVector<f64>,
        candidate: &DVector<f64>,
        stabilizing: &DVector<f64>,
        exogenous: &DVector<f64>,
        options: &CalcOptions,
    ) -> Result<(), ValidationError> {
        let nx = self.model.state_dim();
        let nu = self.model.input_dim();
        let np = self.model.param_dim();

        if state.len() != nx {
            return Err(ValidationError::StateDimMismatch {
                expected: nx,
                got: state.len(),
            });
        }
        if candidate.len() != nu {
            return Err(ValidationError::InputDimMismatch {
                expected: nu,
                got: candidate.len(),
            });
        }
        if stabilizing.len() != nu {
            return Err(ValidationError::InputDimMismatch {
                expected: nu,
                got: stabilizing.len(),
            });
        }
        if exogenous.len() != np {
            return Err(ValidationError::ParamDimMismatch {
                expected: np,
                got: exogenous.len(),
            });
        }
        if let Some(reference) = &options.state_reference {
            if reference.len() != nx {
                return Err(ValidationError::StateDimMismatch {
                    expected: nx,
                    got: reference.len(),
                });
            }
        }
        if let Some(previous) = &options.previous_input {
            if previous.len() != nu {
                return Err(ValidationError::InputDimMismatch {
                    expected: nu,
                    got: previous.len(),
                });
            }
        } else if self.config.slew_rate.is_some() {
            return Err(ValidationError::MissingPreviousInput);
        }

        for (field, vector) in [
            ("state", state),
            ("candidate", candidate),
            ("stabilizing", stabilizing),
            ("exogenous", exogenous),
        ] {
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(ValidationError::NonFinite { field });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use corral_core::config::ObjectiveMode;
    use corral_core::polytope::Polytope;
    use corral_test_utils::oracle::StaticOracle;
    use corral_test_utils::plants::{DoubleIntegrator, ScalarPlant};
    use nalgebra::{dmatrix, dvector, DMatrix};
    use std::fs;
    use std::path::PathBuf;

    fn scalar_oracle() -> StaticOracle {
        StaticOracle::new(TerminalSet {
            shape: dmatrix![4.0],
            gain: dmatrix![0.0],
            state_center: dvector![0.0],
            input_center: dvector![0.0],
        })
    }

    fn scalar_constraints() -> Constraints {
        Constraints::new(
            Polytope::symmetric_box(&[1.0]).unwrap(),
            Polytope::symmetric_box(&[1.0]).unwrap(),
        )
    }

    fn cache_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(name)
    }

    fn scalar_config(cache: &str) -> FilterConfig {
        FilterConfig {
            horizon: 3,
            duration: 3.0,
            cache_dir: cache_dir(cache),
            ..FilterConfig::default()
        }
    }

    fn scalar_filter(cache: &str) -> SafetyFilter<ScalarPlant> {
        SafetyFilter::new(
            ScalarPlant,
            scalar_constraints(),
            &ParameterBounds::new(),
            &Weights::default(),
            scalar_config(cache),
            &scalar_oracle(),
        )
        .unwrap()
    }

    fn no_exo() -> DVector<f64> {
        DVector::zeros(0)
    }

    #[test]
    fn clamps_an_unsafe_candidate_to_the_input_box() {
        let dir = cache_dir("corral-filter-clamp-test");
        let mut filter = scalar_filter("corral-filter-clamp-test");

        let correction = filter
            .calc(
                &dvector![0.2],
                &dvector![2.0],
                &dvector![0.0],
                &no_exo(),
                &CalcOptions::default(),
            )
            .unwrap();
        assert_relative_eq!(correction.action[0], 1.0, epsilon = 1e-4);

        // Cleanup
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn passes_a_safe_candidate_through() {
        let dir = cache_dir("corral-filter-pass-test");
        let mut filter = scalar_filter("corral-filter-pass-test");

        let correction = filter
            .calc(
                &dvector![0.2],
                &dvector![0.3],
                &dvector![0.0],
                &no_exo(),
                &CalcOptions::default(),
            )
            .unwrap();
        assert_relative_eq!(correction.action[0], 0.3, epsilon = 1e-4);

        // Cleanup
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn slew_limits_require_the_previous_input() {
        let dir = cache_dir("corral-filter-slew-test");
        let config = FilterConfig {
            slew_rate: Some(vec![0.5]),
            ..scalar_config("corral-filter-slew-test")
        };
        let mut filter = SafetyFilter::new(
            ScalarPlant,
            scalar_constraints(),
            &ParameterBounds::new(),
            &Weights::default(),
            config,
            &scalar_oracle(),
        )
        .unwrap();

        let result = filter.calc(
            &dvector![0.2],
            &dvector![0.3],
            &dvector![0.0],
            &no_exo(),
            &CalcOptions::default(),
        );
        assert!(matches!(
            result,
            Err(CorralError::Validation(ValidationError::MissingPreviousInput))
        ));

        let options = CalcOptions {
            previous_input: Some(dvector![0.1]),
            ..CalcOptions::default()
        };
        let correction = filter
            .calc(&dvector![0.2], &dvector![0.3], &dvector![0.0], &no_exo(), &options)
            .unwrap();
        assert!(correction.action[0].is_finite());

        // Cleanup
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_runtime_dimension_mismatches() {
        let dir = cache_dir("corral-filter-dims-test");
        let mut filter = scalar_filter("corral-filter-dims-test");
        let options = CalcOptions::default();

        let bad_state = filter.calc(
            &dvector![0.2, 0.1],
            &dvector![0.3],
            &dvector![0.0],
            &no_exo(),
            &options,
        );
        assert!(matches!(
            bad_state,
            Err(CorralError::Validation(ValidationError::StateDimMismatch {
                expected: 1,
                got: 2
            }))
        ));

        let bad_candidate = filter.calc(
            &dvector![0.2],
            &dvector![0.3, 0.1],
            &dvector![0.0],
            &no_exo(),
            &options,
        );
        assert!(matches!(
            bad_candidate,
            Err(CorralError::Validation(ValidationError::InputDimMismatch {
                expected: 1,
                got: 2
            }))
        ));

        let bad_exo = filter.calc(
            &dvector![0.2],
            &dvector![0.3],
            &dvector![0.0],
            &dvector![10.0],
            &options,
        );
        assert!(matches!(
            bad_exo,
            Err(CorralError::Validation(ValidationError::ParamDimMismatch {
                expected: 0,
                got: 1
            }))
        ));

        // Cleanup
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_non_finite_runtime_values() {
        let dir = cache_dir("corral-filter-nan-test");
        let mut filter = scalar_filter("corral-filter-nan-test");

        let result = filter.calc(
            &dvector![f64::NAN],
            &dvector![0.3],
            &dvector![0.0],
            &no_exo(),
            &CalcOptions::default(),
        );
        assert!(matches!(
            result,
            Err(CorralError::Validation(ValidationError::NonFinite {
                field: "state"
            }))
        ));

        // Cleanup
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn reset_reproduces_the_cold_start() {
        let dir = cache_dir("corral-filter-reset-test");
        let mut filter = scalar_filter("corral-filter-reset-test");
        let state = dvector![0.2];
        let candidate = dvector![0.8];
        let stabilizing = dvector![0.0];
        let options = CalcOptions::default();

        let cold = filter
            .calc(&state, &candidate, &stabilizing, &no_exo(), &options)
            .unwrap();
        let warm = filter
            .calc(&state, &candidate, &stabilizing, &no_exo(), &options)
            .unwrap();
        assert_eq!(cold.rounds, 2);
        assert_eq!(warm.rounds, 1);

        filter.reset_init_guess();
        let again = filter
            .calc(&state, &candidate, &stabilizing, &no_exo(), &options)
            .unwrap();
        assert_eq!(again.rounds, 2);
        assert_relative_eq!(again.action[0], cold.action[0], epsilon = 1e-12);

        // Cleanup
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn discarded_solutions_do_not_warm_start() {
        let dir = cache_dir("corral-filter-discard-test");
        let mut filter = scalar_filter("corral-filter-discard-test");
        let state = dvector![0.2];
        let candidate = dvector![0.8];
        let stabilizing = dvector![0.0];

        let probe = CalcOptions {
            discard_solution: true,
            ..CalcOptions::default()
        };
        let first = filter
            .calc(&state, &candidate, &stabilizing, &no_exo(), &probe)
            .unwrap();
        assert_eq!(first.rounds, 2);

        let second = filter
            .calc(&state, &candidate, &stabilizing, &no_exo(), &CalcOptions::default())
            .unwrap();
        assert_eq!(second.rounds, 2);

        // Cleanup
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn tracking_objective_pulls_toward_the_reference() {
        let dir = cache_dir("corral-filter-tracking-test");
        let config = FilterConfig {
            horizon: 3,
            duration: 3.0,
            objective: ObjectiveMode::Tracking { track_input: false },
            cache_dir: dir.clone(),
            ..FilterConfig::default()
        };
        let weights = Weights {
            state: Some(DMatrix::identity(2, 2)),
            ..Weights::default()
        };
        let oracle = StaticOracle::new(TerminalSet {
            shape: DMatrix::identity(2, 2) * 4.0,
            gain: dmatrix![-1.0, -1.5],
            state_center: DVector::zeros(2),
            input_center: DVector::zeros(1),
        });
        let mut filter = SafetyFilter::new(
            DoubleIntegrator,
            Constraints::new(
                Polytope::symmetric_box(&[1.0, 1.0]).unwrap(),
                Polytope::symmetric_box(&[1.0]).unwrap(),
            ),
            &ParameterBounds::new(),
            &weights,
            config,
            &oracle,
        )
        .unwrap();

        // Reference defaults to the origin, so from a positive position the
        // tracking objective must brake.
        let correction = filter
            .calc(
                &dvector![0.5, 0.0],
                &dvector![0.0],
                &dvector![0.0],
                &no_exo(),
                &CalcOptions::default(),
            )
            .unwrap();
        assert!(
            correction.action[0] < -0.01,
            "Tracking should brake toward the origin, got {}",
            correction.action[0]
        );

        // Cleanup
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn construction_rejects_mismatched_polytopes() {
        let result = SafetyFilter::new(
            ScalarPlant,
            Constraints::new(
                Polytope::symmetric_box(&[1.0, 1.0]).unwrap(),
                Polytope::symmetric_box(&[1.0]).unwrap(),
            ),
            &ParameterBounds::new(),
            &Weights::default(),
            scalar_config("corral-filter-polytope-test"),
            &scalar_oracle(),
        );
        assert!(matches!(
            result,
            Err(CorralError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
