use crate::conic::{hermitian_psd_block, ConeProgram, SolverConfig};
use crate::error::{FitStatus, Result, TomographyError};
use crate::utils::{
    frob_norm, hermitian_from_params, hermitian_log, is_hermitian, min_eigenvalue,
    real_parameter_row, trace_product, vectorize,
};
use crate::FitResult;
use clarabel::solver::SupportedConeT::{ExponentialConeT, NonnegativeConeT, ZeroConeT};
use ndarray::{Array1, Array2, ArrayView2};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, trace};

const HERMITIAN_TOL: f64 = 1e-9;
const PSD_TOL: f64 = 1e-9;
const PROB_FLOOR: f64 = 1e-12;

/// Convex reformulations of the log-likelihood objective.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvexVariant {
    /// Probabilities enter the exponential cones as affine expressions of
    /// the state parameters.
    Direct,
    /// Probabilities get explicit nonnegative variables pinned by equality
    /// rows.
    Auxiliary,
}

impl FromStr for ConvexVariant {
    type Err = TomographyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ConvexVariant::Direct),
            "auxiliary" => Ok(ConvexVariant::Auxiliary),
            _ => Err(TomographyError::UnsupportedConfiguration(format!(
                "unknown convex variant: {}",
                s
            ))),
        }
    }
}

/// Options of the diluted fixed point iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DilutedOptions {
    /// Dilution strength; smaller values take more aggressive steps.
    pub delta: f64,
    /// Entropy penalty weight. Zero disables the penalty and is the
    /// verified default; positive values are experimental.
    pub lambda: f64,
    /// Convergence threshold on the Frobenius step size per matrix entry.
    pub tol: f64,
    pub max_iter: usize,
    /// Starting state; the maximally mixed state when absent.
    pub seed: Option<Array2<Complex<f64>>>,
}

impl Default for DilutedOptions {
    fn default() -> Self {
        Self {
            delta: 0.05,
            lambda: 0.0,
            tol: 1e-9,
            max_iter: 100_000,
            seed: None,
        }
    }
}

/// Maximum likelihood state tomography over a POVM.
///
/// Construction validates that every effect is Hermitian, positive
/// semidefinite and has trace at most one. [`fit`](MlStateTomo::fit) runs
/// the solver free diluted iteration and is the preferred entry point;
/// [`fit_convex`](MlStateTomo::fit_convex) solves the same problem through
/// an exponential cone program and is slower and less forgiving.
pub struct MlStateTomo {
    effects: Vec<Array2<Complex<f64>>>,
    dim: usize,
}

impl MlStateTomo {
    pub fn new(effects: Vec<Array2<Complex<f64>>>) -> Result<Self> {
        let first = effects.first().ok_or_else(|| {
            TomographyError::InvalidArgument(
                "at least one measurement effect is required".to_string(),
            )
        })?;
        let d = first.nrows();
        if d == 0 {
            return Err(TomographyError::InvalidArgument(
                "effects must be nonempty matrices".to_string(),
            ));
        }
        for (i, e) in effects.iter().enumerate() {
            if e.nrows() != d || e.ncols() != d {
                return Err(TomographyError::DimensionMismatch(format!(
                    "effect {} is {}x{}, expected {}x{}",
                    i,
                    e.nrows(),
                    e.ncols(),
                    d,
                    d
                )));
            }
            if !is_hermitian(e.view(), HERMITIAN_TOL) {
                return Err(TomographyError::InvalidArgument(format!(
                    "effect {} is not hermitian",
                    i
                )));
            }
            if min_eigenvalue(e.view())? < -PSD_TOL {
                return Err(TomographyError::InvalidArgument(format!(
                    "effect {} is not positive semidefinite",
                    i
                )));
            }
            let tr = e.diag().sum().re;
            if tr > 1.0 + HERMITIAN_TOL {
                return Err(TomographyError::InvalidArgument(format!(
                    "effect {} has trace {} greater than one",
                    i, tr
                )));
            }
        }
        let dim = d;
        Ok(Self { effects, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn effects(&self) -> &[Array2<Complex<f64>>] {
        &self.effects
    }

    /// Outcome probabilities tr(rho effect) of a state.
    pub fn predict(&self, rho: ArrayView2<Complex<f64>>) -> Result<Array1<f64>> {
        self.check_state(rho)?;
        Ok(Array1::from_iter(
            self.effects
                .iter()
                .map(|e| trace_product(e.view(), rho).re),
        ))
    }

    /// Log-likelihood of observed frequencies under a state. Probabilities
    /// are floored at a tiny positive constant.
    pub fn log_likelihood(&self, rho: ArrayView2<Complex<f64>>, freq: &[f64]) -> Result<f64> {
        self.check_state(rho)?;
        if freq.len() != self.effects.len() {
            return Err(TomographyError::DimensionMismatch(format!(
                "expected {} frequencies, got {}",
                self.effects.len(),
                freq.len()
            )));
        }
        let mut acc = 0.0;
        for (e, &f) in self.effects.iter().zip(freq) {
            if f == 0.0 {
                continue;
            }
            let p = trace_product(e.view(), rho).re.max(PROB_FLOOR);
            acc += f * p.ln();
        }
        Ok(acc)
    }

    /// Diluted fixed point iteration: the state is repeatedly conjugated
    /// with a damped likelihood gradient operator until it stops moving.
    ///
    /// Each step builds R = sum_i f_i / tr(rho E_i) E_i, dilutes it twice
    /// with strength 1/delta and applies the result as a two sided update
    /// M rho M followed by renormalization. A positive `lambda` mixes an
    /// entropy gradient into R before dilution.
    pub fn fit(&self, freq: &[f64], options: &DilutedOptions) -> Result<FitResult> {
        self.check_freq(freq)?;
        if !(options.delta > 0.0) {
            return Err(TomographyError::InvalidArgument(
                "dilution delta must be positive".to_string(),
            ));
        }
        if options.lambda < 0.0 {
            return Err(TomographyError::InvalidArgument(
                "entropy weight must be nonnegative".to_string(),
            ));
        }
        let d = self.dim;
        let eye = Array2::<Complex<f64>>::eye(d);
        let mut rho = match &options.seed {
            Some(seed) => {
                if seed.nrows() != d || seed.ncols() != d {
                    return Err(TomographyError::DimensionMismatch(format!(
                        "seed is {}x{}, expected {}x{}",
                        seed.nrows(),
                        seed.ncols(),
                        d,
                        d
                    )));
                }
                let adj = seed.t().mapv(|z| z.conj());
                let sym = (seed + &adj) * 0.5;
                let tr = sym.diag().sum().re;
                if !(tr > 0.0) {
                    return Err(TomographyError::InvalidArgument(
                        "seed must have positive trace".to_string(),
                    ));
                }
                sym / tr
            }
            None => eye.mapv(|z| z / d as f64),
        };
        let eps = 1.0 / options.delta;
        let mut status = FitStatus::MaxIter;
        let mut iterations = options.max_iter;
        for it in 0..options.max_iter {
            let prev = rho.clone();
            let mut update = self.r_operator(&rho, freq);
            if options.lambda > 0.0 {
                let log_rho = hermitian_log(rho.view())?;
                let s = trace_product(rho.view(), log_rho.view()).re;
                let correction = (&log_rho - &(&eye * s)) * options.lambda;
                update -= &correction;
            }
            let t = (&eye + &(update * eps)) / (1.0 + eps);
            let m = (&eye + &(t * eps)) / (1.0 + eps);
            // the exact two sided sandwich, applied as two products
            rho = m.dot(&rho).dot(&m);
            let tr = rho.diag().sum().re;
            if !(tr > 0.0) || !tr.is_finite() {
                rho = prev;
                status = FitStatus::Failed;
                iterations = it;
                break;
            }
            rho.mapv_inplace(|z| z / tr);
            let adj = rho.t().mapv(|z| z.conj());
            rho = (&rho + &adj) * 0.5;
            let delta = &rho - &prev;
            let step = frob_norm(delta.view()) / ((d * d) as f64);
            trace!(iteration = it, step, "diluted update");
            if step < options.tol {
                status = FitStatus::Optimal;
                iterations = it + 1;
                break;
            }
        }
        let objective = self.log_likelihood(rho.view(), freq)?;
        debug!(?status, iterations, objective, "diluted fit finished");
        Ok(FitResult {
            estimate: rho,
            objective,
            status,
            iterations,
        })
    }

    /// Maximize the log-likelihood through an exponential cone program over
    /// the real lift of the state. A positive `beta` adds the hedging term
    /// beta log lambda_min(rho) to the objective; the reported objective is
    /// always the plain log-likelihood of the estimate.
    pub fn fit_convex(
        &self,
        freq: &[f64],
        variant: ConvexVariant,
        beta: f64,
        config: &SolverConfig,
    ) -> Result<FitResult> {
        self.check_freq(freq)?;
        if !(beta >= 0.0) {
            return Err(TomographyError::InvalidArgument(
                "hedging parameter must be nonnegative".to_string(),
            ));
        }
        let d = self.dim;
        let np = d * d;
        let mut active: Vec<(Vec<f64>, f64)> = Vec::new();
        for (e, &f) in self.effects.iter().zip(freq) {
            if f > 0.0 {
                let row = vectorize(e.view()).mapv(|z| z.conj());
                active.push((real_parameter_row(d, row.view()), f));
            }
        }
        let ka = active.len();
        let hedged = beta > 0.0;
        let base = match variant {
            ConvexVariant::Direct => np + ka,
            ConvexVariant::Auxiliary => np + 2 * ka,
        };
        let nvars = base + if hedged { 2 } else { 0 };
        let mut prog = ConeProgram::new(nvars);
        prog.row((0..d).map(|i| (i, 1.0)), 1.0);
        prog.cone(ZeroConeT(1));
        match variant {
            ConvexVariant::Direct => {
                let v0 = np;
                for (slot, (crow, f)) in active.iter().enumerate() {
                    prog.cost(v0 + slot, -*f);
                    prog.row([(v0 + slot, -1.0)], 0.0);
                    prog.row(std::iter::empty(), 1.0);
                    prog.row(crow.iter().enumerate().map(|(j, &cj)| (j, -cj)), 0.0);
                    prog.cone(ExponentialConeT());
                }
            }
            ConvexVariant::Auxiliary => {
                let p0 = np;
                let v0 = np + ka;
                for (slot, (crow, _)) in active.iter().enumerate() {
                    prog.row(
                        std::iter::once((p0 + slot, 1.0))
                            .chain(crow.iter().enumerate().map(|(j, &cj)| (j, -cj))),
                        0.0,
                    );
                }
                prog.cone(ZeroConeT(ka));
                for slot in 0..ka {
                    prog.row([(p0 + slot, -1.0)], 0.0);
                }
                prog.cone(NonnegativeConeT(ka));
                for (slot, (_, f)) in active.iter().enumerate() {
                    prog.cost(v0 + slot, -*f);
                    prog.row([(v0 + slot, -1.0)], 0.0);
                    prog.row(std::iter::empty(), 1.0);
                    prog.row([(p0 + slot, -1.0)], 0.0);
                    prog.cone(ExponentialConeT());
                }
            }
        }
        let shift = if hedged {
            let t = nvars - 2;
            let vh = nvars - 1;
            prog.cost(vh, -beta);
            prog.row([(vh, -1.0)], 0.0);
            prog.row(std::iter::empty(), 1.0);
            prog.row([(t, -1.0)], 0.0);
            prog.cone(ExponentialConeT());
            Some(t)
        } else {
            None
        };
        hermitian_psd_block(&mut prog, d, shift);
        let sol = prog.solve(config)?;
        let estimate = hermitian_from_params(d, &sol.x[..np])?;
        let objective = self.log_likelihood(estimate.view(), freq)?;
        Ok(FitResult {
            estimate,
            objective,
            status: sol.status,
            iterations: sol.iterations,
        })
    }

    fn r_operator(&self, rho: &Array2<Complex<f64>>, freq: &[f64]) -> Array2<Complex<f64>> {
        let d = self.dim;
        let mut r = Array2::zeros((d, d));
        for (e, &f) in self.effects.iter().zip(freq) {
            if f == 0.0 {
                continue;
            }
            let p = trace_product(e.view(), rho.view()).re.max(PROB_FLOOR);
            r += &(e * (f / p));
        }
        r
    }

    fn check_state(&self, rho: ArrayView2<Complex<f64>>) -> Result<()> {
        if rho.nrows() != self.dim || rho.ncols() != self.dim {
            return Err(TomographyError::DimensionMismatch(format!(
                "state is {}x{}, expected {}x{}",
                rho.nrows(),
                rho.ncols(),
                self.dim,
                self.dim
            )));
        }
        Ok(())
    }

    fn check_freq(&self, freq: &[f64]) -> Result<()> {
        if freq.len() != self.effects.len() {
            return Err(TomographyError::DimensionMismatch(format!(
                "expected {} frequencies, got {}",
                self.effects.len(),
                freq.len()
            )));
        }
        if freq.iter().any(|f| !(*f >= 0.0)) {
            return Err(TomographyError::InvalidArgument(
                "frequencies must be nonnegative".to_string(),
            ));
        }
        if freq.iter().all(|f| *f == 0.0) {
            return Err(TomographyError::InvalidArgument(
                "all frequencies are zero".to_string(),
            ));
        }
        Ok(())
    }
}
