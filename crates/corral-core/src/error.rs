use thiserror::Error;

/// Top-level error type for the corral workspace.
#[derive(Debug, Error)]
pub enum CorralError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Terminal set error: {0}")]
    Terminal(#[from] TerminalSetError),

    #[error("Solve error: {0}")]
    Solve(#[from] SolveError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid horizon: {0} (must be >= 1)")]
    InvalidHorizon(usize),

    #[error("Invalid horizon duration: {0} (must be > 0)")]
    InvalidDuration(f64),

    #[error("Invalid terminal margin: {0} (must be > 0)")]
    InvalidMargin(f64),

    #[error("Invalid command interval: {0} (must be > 0)")]
    InvalidCommandInterval(f64),

    #[error("Unknown linearization variable: {0}")]
    UnknownVariable(String),

    #[error("Missing parameter bound for linearization variable: {0}")]
    MissingBound(String),

    #[error("Tracking objective requires a state weight matrix")]
    MissingStateWeight,

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Terminal set synthesis and cache errors.
#[derive(Debug, Error)]
pub enum TerminalSetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache record error: {0}")]
    Record(#[from] serde_json::Error),

    #[error("Terminal set synthesis failed: {0}")]
    Synthesis(String),

    #[error("Terminal shape matrix is not symmetric")]
    NotSymmetric,

    #[error("Terminal shape matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("Terminal set field {field} has wrong shape: expected {rows}x{cols}")]
    Shape {
        field: &'static str,
        rows: usize,
        cols: usize,
    },

    #[error("Terminal set field {field} has a non-finite entry")]
    NonFinite { field: &'static str },
}

/// Errors from the SQP loop and its conic backend.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("Conic subproblem rejected by backend")]
    ProblemSetup,

    #[error("Backend did not converge: {status}")]
    NotConverged { status: String },

    #[error("Linearization did not settle within {limit} rounds")]
    IterationLimit { limit: usize },
}

/// Runtime argument validation errors.
///
/// Copy + static messages for cheap propagation in the per-step hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("State dimension mismatch: expected {expected}, got {got}")]
    StateDimMismatch { expected: usize, got: usize },

    #[error("Input dimension mismatch: expected {expected}, got {got}")]
    InputDimMismatch { expected: usize, got: usize },

    #[error("Parameter dimension mismatch: expected {expected}, got {got}")]
    ParamDimMismatch { expected: usize, got: usize },

    #[error("Slew rate limits require the previously applied input")]
    MissingPreviousInput,

    #[error("Non-finite value in {field}")]
    NonFinite { field: &'static str },
}
