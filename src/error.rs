use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TomographyError>;

#[derive(Debug, Error)]
pub enum TomographyError {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
    #[error("solver failure: {0}")]
    Solver(String),
}

/// Outcome of a fit. Non-convergence is reported here, not as an error:
/// a `MaxIter` or `Infeasible` result still carries the last iterate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Optimal,
    MaxIter,
    Infeasible,
    Failed,
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FitStatus::Optimal => "optimal",
            FitStatus::MaxIter => "maximum iterations reached",
            FitStatus::Infeasible => "infeasible",
            FitStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}
