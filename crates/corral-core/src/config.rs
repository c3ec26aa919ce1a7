use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Interval bounds for linearization variables, keyed by label.
pub type ParameterBounds = HashMap<String, [f64; 2]>;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_horizon() -> usize {
    20
}
const fn default_duration() -> f64 {
    20.0
}
const fn default_margin() -> f64 {
    0.9
}
const fn default_command_interval() -> f64 {
    1.0
}
const fn default_true() -> bool {
    true
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".")
}
const fn default_max_iter() -> u32 {
    200
}
const fn default_max_rounds() -> usize {
    30
}
const fn default_tol() -> f64 {
    1e-8
}
const fn default_step_tol() -> f64 {
    1e-6
}

// ---------------------------------------------------------------------------
// Mode enums
// ---------------------------------------------------------------------------

/// Discretization scheme for the predicted dynamics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discretization {
    /// Classical fixed-step Runge-Kutta, four substeps per stage.
    RungeKutta,
    /// First-order Taylor step on the Jacobians at the linearization point:
    /// `x+ = (I + dt A) x + dt B u`.
    Taylor,
    /// Adaptive continuous integration is not offered; the variant cannot
    /// be constructed.
    #[serde(skip)]
    Continuous(Infallible),
}

impl Default for Discretization {
    fn default() -> Self {
        Self::RungeKutta
    }
}

/// What the filter minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveMode {
    /// Weighted deviation of the first predicted input from the candidate.
    MinimalCorrection,
    /// Weighted deviation of every predicted state from a reference.
    Tracking {
        /// Also penalize every predicted input against the candidate.
        #[serde(default)]
        track_input: bool,
    },
}

impl Default for ObjectiveMode {
    fn default() -> Self {
        Self::MinimalCorrection
    }
}

/// Numerical backend for the per-round subproblem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverBackend {
    /// Clarabel interior-point conic solver.
    InteriorPoint,
    /// A dedicated QP path is not offered; the variant cannot be constructed.
    #[serde(skip)]
    Qp(Infallible),
}

impl Default for SolverBackend {
    fn default() -> Self {
        Self::InteriorPoint
    }
}

// ---------------------------------------------------------------------------
// SolverSettings
// ---------------------------------------------------------------------------

/// Tolerances and iteration caps for the SQP loop and its backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    #[serde(default)]
    pub backend: SolverBackend,

    /// Interior-point iteration cap per conic subproblem.
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,

    /// Relinearization round cap per filter call.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Backend gap and feasibility tolerance.
    #[serde(default = "default_tol")]
    pub tol: f64,

    /// Infinity-norm iterate step below which relinearization stops.
    #[serde(default = "default_step_tol")]
    pub step_tol: f64,

    /// Print backend progress to stdout.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            backend: SolverBackend::default(),
            max_iter: default_max_iter(),
            max_rounds: default_max_rounds(),
            tol: default_tol(),
            step_tol: default_step_tol(),
            verbose: false,
        }
    }
}

impl SolverSettings {
    /// Validate settings. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iter == 0 {
            return Err(ConfigError::InvalidValue {
                field: "solver.max_iter".into(),
                message: "must be >= 1".into(),
            });
        }
        if self.max_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "solver.max_rounds".into(),
                message: "must be >= 1".into(),
            });
        }
        if !(self.tol > 0.0 && self.tol.is_finite()) {
            return Err(ConfigError::InvalidValue {
                field: "solver.tol".into(),
                message: format!("{} is not a positive tolerance", self.tol),
            });
        }
        if !(self.step_tol > 0.0 && self.step_tol.is_finite()) {
            return Err(ConfigError::InvalidValue {
                field: "solver.step_tol".into(),
                message: format!("{} is not a positive tolerance", self.step_tol),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FilterConfig
// ---------------------------------------------------------------------------

/// Main safety filter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Number of prediction stages `N` (default: 20).
    #[serde(default = "default_horizon")]
    pub horizon: usize,

    /// Horizon duration `T` in seconds (default: 20). The per-stage step
    /// is `T / N`.
    #[serde(default = "default_duration")]
    pub duration: f64,

    /// Terminal level `alpha`: the last predicted state must satisfy
    /// `(x - cx)' P (x - cx) <= alpha` (default: 0.9).
    #[serde(default = "default_margin")]
    pub margin: f64,

    /// Soften the stage dynamics with heavily penalized slack variables
    /// (default: true).
    #[serde(default = "default_true")]
    pub softening: bool,

    /// Per-channel slew rate limits in input units per second. `None`
    /// disables rate limiting.
    #[serde(default)]
    pub slew_rate: Option<Vec<f64>>,

    /// Wall-clock spacing of filter calls in seconds (default: 1). Scales
    /// the slew bound on the first predicted input and sets the discrete
    /// step handed to the terminal-set oracle.
    #[serde(default = "default_command_interval")]
    pub command_interval: f64,

    #[serde(default)]
    pub discretization: Discretization,

    #[serde(default)]
    pub objective: ObjectiveMode,

    /// Directory where synthesized terminal sets are persisted.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default)]
    pub solver: SolverSettings,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            horizon: default_horizon(),
            duration: default_duration(),
            margin: default_margin(),
            softening: default_true(),
            slew_rate: None,
            command_interval: default_command_interval(),
            discretization: Discretization::default(),
            objective: ObjectiveMode::default(),
            cache_dir: default_cache_dir(),
            solver: SolverSettings::default(),
        }
    }
}

impl FilterConfig {
    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon == 0 {
            return Err(ConfigError::InvalidHorizon(self.horizon));
        }
        if !(self.duration > 0.0 && self.duration.is_finite()) {
            return Err(ConfigError::InvalidDuration(self.duration));
        }
        if !(self.margin > 0.0 && self.margin.is_finite()) {
            return Err(ConfigError::InvalidMargin(self.margin));
        }
        if !(self.command_interval > 0.0 && self.command_interval.is_finite()) {
            return Err(ConfigError::InvalidCommandInterval(self.command_interval));
        }
        if let Some(rates) = &self.slew_rate {
            if rates.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "slew_rate".into(),
                    message: "must name at least one channel".into(),
                });
            }
            if rates.iter().any(|r| !(r.is_finite() && *r > 0.0)) {
                return Err(ConfigError::InvalidValue {
                    field: "slew_rate".into(),
                    message: "every entry must be positive and finite".into(),
                });
            }
        }
        self.solver.validate()
    }

    /// Per-stage prediction step `T / N` in seconds.
    #[allow(clippy::cast_precision_loss)]
    pub fn stage_dt(&self) -> f64 {
        self.duration / self.horizon as f64
    }

    /// Load from TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Objective weight matrices, supplied at filter construction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Weights {
    /// Input deviation weight `R`. `None` selects the identity.
    pub input: Option<DMatrix<f64>>,
    /// State deviation weight `Q`. Required by the tracking objective.
    pub state: Option<DMatrix<f64>>,
}

impl Weights {
    /// Validate weight shapes against plant dimensions and objective mode.
    pub fn validate(
        &self,
        state_dim: usize,
        input_dim: usize,
        objective: &ObjectiveMode,
    ) -> Result<(), ConfigError> {
        if let Some(r) = &self.input {
            if r.shape() != (input_dim, input_dim) {
                return Err(ConfigError::InvalidValue {
                    field: "weights.input".into(),
                    message: format!(
                        "expected {input_dim}x{input_dim}, got {}x{}",
                        r.nrows(),
                        r.ncols()
                    ),
                });
            }
        }
        match &self.state {
            Some(q) => {
                if q.shape() != (state_dim, state_dim) {
                    return Err(ConfigError::InvalidValue {
                        field: "weights.state".into(),
                        message: format!(
                            "expected {state_dim}x{state_dim}, got {}x{}",
                            q.nrows(),
                            q.ncols()
                        ),
                    });
                }
            }
            None => {
                if matches!(objective, ObjectiveMode::Tracking { .. }) {
                    return Err(ConfigError::MissingStateWeight);
                }
            }
        }
        Ok(())
    }

    /// Input weight with the identity default applied.
    pub fn resolved_input(&self, input_dim: usize) -> DMatrix<f64> {
        self.input
            .clone()
            .unwrap_or_else(|| DMatrix::identity(input_dim, input_dim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- FilterConfig defaults and validation ----

    #[test]
    fn default_config_is_valid() {
        let cfg = FilterConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.horizon, 20);
        assert!((cfg.duration - 20.0).abs() < f64::EPSILON);
        assert!((cfg.margin - 0.9).abs() < f64::EPSILON);
        assert!(cfg.softening);
        assert!(cfg.slew_rate.is_none());
        assert_eq!(cfg.discretization, Discretization::RungeKutta);
        assert_eq!(cfg.objective, ObjectiveMode::MinimalCorrection);
        assert_eq!(cfg.cache_dir, PathBuf::from("."));
    }

    #[test]
    fn stage_dt_divides_duration_by_horizon() {
        let cfg = FilterConfig {
            horizon: 40,
            duration: 10.0,
            ..FilterConfig::default()
        };
        assert!((cfg.stage_dt() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_zero_horizon() {
        let cfg = FilterConfig {
            horizon: 0,
            ..FilterConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidHorizon(0))
        ));
    }

    #[test]
    fn validate_rejects_non_positive_duration_and_margin() {
        let cfg = FilterConfig {
            duration: 0.0,
            ..FilterConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidDuration(_))));

        let cfg = FilterConfig {
            margin: -0.1,
            ..FilterConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidMargin(_))));
    }

    #[test]
    fn validate_rejects_bad_slew_entries() {
        let cfg = FilterConfig {
            slew_rate: Some(vec![0.5, -1.0]),
            ..FilterConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = FilterConfig {
            slew_rate: Some(vec![]),
            ..FilterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_solver_settings() {
        let cfg = FilterConfig {
            solver: SolverSettings {
                max_rounds: 0,
                ..SolverSettings::default()
            },
            ..FilterConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = FilterConfig {
            solver: SolverSettings {
                step_tol: f64::NAN,
                ..SolverSettings::default()
            },
            ..FilterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    // ---- TOML ----

    #[test]
    fn config_toml_deserialization() {
        let toml_str = r#"
            horizon = 10
            duration = 5.0
            margin = 0.8
            softening = false
            slew_rate = [0.3, 0.5]
            command_interval = 0.1
            discretization = "taylor"
            cache_dir = "/tmp/corral"

            [solver]
            max_iter = 50
            step_tol = 1e-4
        "#;
        let cfg: FilterConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.horizon, 10);
        assert!((cfg.duration - 5.0).abs() < f64::EPSILON);
        assert!(!cfg.softening);
        assert_eq!(cfg.slew_rate, Some(vec![0.3, 0.5]));
        assert_eq!(cfg.discretization, Discretization::Taylor);
        assert_eq!(cfg.cache_dir, PathBuf::from("/tmp/corral"));
        assert_eq!(cfg.solver.max_iter, 50);
        assert!((cfg.solver.step_tol - 1e-4).abs() < f64::EPSILON);
        assert_eq!(cfg.solver.max_rounds, 30);
    }

    #[test]
    fn config_toml_defaults() {
        let cfg: FilterConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, FilterConfig::default());
    }

    #[test]
    fn config_toml_tracking_objective() {
        let toml_str = r"
            [objective.tracking]
            track_input = true
        ";
        let cfg: FilterConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            cfg.objective,
            ObjectiveMode::Tracking { track_input: true }
        );
    }

    // ---- FilterConfig from_file ----

    #[test]
    fn config_from_file() {
        let dir = std::env::temp_dir().join("corral_test_filter_config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("filter.toml");
        std::fs::write(
            &path,
            r#"
            horizon = 15
            duration = 30.0
            discretization = "runge_kutta"
        "#,
        )
        .unwrap();

        let cfg = FilterConfig::from_file(&path).unwrap();
        assert_eq!(cfg.horizon, 15);
        assert!((cfg.duration - 30.0).abs() < f64::EPSILON);
        assert_eq!(cfg.discretization, Discretization::RungeKutta);

        // Cleanup
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn config_from_file_invalid() {
        let dir = std::env::temp_dir().join("corral_test_filter_config_invalid");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("invalid.toml");
        std::fs::write(&path, "horizon = 0").unwrap();

        let result = FilterConfig::from_file(&path);
        assert!(result.is_err());

        // Cleanup
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn config_from_file_not_found() {
        let result = FilterConfig::from_file("/nonexistent/path/filter.toml");
        assert!(result.is_err());
    }

    // ---- Weights ----

    #[test]
    fn weights_default_passes_minimal_correction() {
        let w = Weights::default();
        assert!(w.validate(3, 2, &ObjectiveMode::MinimalCorrection).is_ok());
        let r = w.resolved_input(2);
        assert_eq!(r, DMatrix::identity(2, 2));
    }

    #[test]
    fn weights_tracking_requires_state_matrix() {
        let w = Weights::default();
        let err = w
            .validate(3, 2, &ObjectiveMode::Tracking { track_input: false })
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingStateWeight));

        let w = Weights {
            state: Some(DMatrix::identity(3, 3)),
            ..Weights::default()
        };
        assert!(
            w.validate(3, 2, &ObjectiveMode::Tracking { track_input: false })
                .is_ok()
        );
    }

    #[test]
    fn weights_reject_wrong_shapes() {
        let w = Weights {
            input: Some(DMatrix::identity(3, 3)),
            ..Weights::default()
        };
        assert!(w.validate(3, 2, &ObjectiveMode::MinimalCorrection).is_err());

        let w = Weights {
            state: Some(DMatrix::identity(2, 2)),
            ..Weights::default()
        };
        assert!(w.validate(3, 2, &ObjectiveMode::MinimalCorrection).is_err());
    }
}
