//! Quantum state and process tomography: predictor construction, free and
//! physically constrained least squares, and maximum likelihood estimation
//! through either a diluted fixed point iteration or exponential cone
//! programs.

mod conic;
pub mod error;
pub mod lstsq;
pub mod mle;
pub mod predictor;
pub mod process;
pub mod ptrace;
pub mod utils;

pub use crate::conic::SolverConfig;
pub use crate::error::{FitStatus, Result, TomographyError};
pub use crate::lstsq::{FreeLsStateTomo, LsAlgorithm, LsStateTomo};
pub use crate::mle::{ConvexVariant, DilutedOptions, MlStateTomo};
pub use crate::predictor::{build_process_predictor, build_state_predictor, predict_means};
pub use crate::process::{qpt_ml, ProcessTomo};
pub use crate::ptrace::{sop_apply, trb_sop};

use ndarray::Array2;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Outcome of a tomographic fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FitResult {
    /// Estimated density or Choi matrix.
    pub estimate: Array2<Complex<f64>>,
    /// Residual norm for least squares fits, log-likelihood for maximum
    /// likelihood fits.
    pub objective: f64,
    pub status: FitStatus,
    /// Interior point or fixed point iterations spent.
    pub iterations: usize,
}
