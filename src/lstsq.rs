use crate::conic::{hermitian_psd_block, weighted_residual_soc, ConeProgram, SolverConfig};
use crate::error::{FitStatus, Result, TomographyError};
use crate::predictor::{build_state_predictor, predict_means};
use crate::utils::{
    hermitian_from_params, is_hermitian, real_parameter_row, unvectorize, vectorize,
};
use crate::FitResult;
use clarabel::solver::SupportedConeT::ZeroConeT;
use ndarray::{Array1, Array2, ArrayView2};
use ndarray_linalg::LeastSquaresSvd;
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const HERMITIAN_TOL: f64 = 1e-9;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LsAlgorithm {
    /// Ordinary least squares; variances are ignored.
    #[default]
    Ols,
    /// Generalized least squares; rows are scaled by inverse standard
    /// deviation and variances are required.
    Gls,
}

impl FromStr for LsAlgorithm {
    type Err = TomographyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ols" => Ok(LsAlgorithm::Ols),
            "gls" => Ok(LsAlgorithm::Gls),
            _ => Err(TomographyError::UnsupportedConfiguration(format!(
                "unknown least squares algorithm: {}",
                s
            ))),
        }
    }
}

pub(crate) fn check_variances(k: usize, vars: &[f64]) -> Result<()> {
    if vars.len() != k {
        return Err(TomographyError::DimensionMismatch(format!(
            "expected {} variances, got {}",
            k,
            vars.len()
        )));
    }
    if vars.iter().any(|v| !(*v > 0.0)) {
        return Err(TomographyError::InvalidArgument(
            "variances must be positive".to_string(),
        ));
    }
    Ok(())
}

/// SVD least squares solve of `predictor . x = means`, optionally weighted.
/// Returns the vectorized solution and the residual norm per observation.
pub(crate) fn free_fit(
    predictor: ArrayView2<Complex<f64>>,
    means: &[f64],
    variances: Option<&[f64]>,
    algorithm: LsAlgorithm,
) -> Result<(Array1<Complex<f64>>, f64)> {
    let k = predictor.nrows();
    if means.len() != k {
        return Err(TomographyError::DimensionMismatch(format!(
            "predictor has {} rows but {} means were given",
            k,
            means.len()
        )));
    }
    let mut a = predictor.to_owned();
    let mut b = Array1::from_iter(means.iter().map(|&m| Complex::new(m, 0.0)));
    if let LsAlgorithm::Gls = algorithm {
        let vars = variances.ok_or_else(|| {
            TomographyError::InvalidArgument(
                "generalized least squares requires variances".to_string(),
            )
        })?;
        check_variances(k, vars)?;
        for (i, &v) in vars.iter().enumerate() {
            let w = 1.0 / v.sqrt();
            a.row_mut(i).mapv_inplace(|z| z * w);
            b[i] *= w;
        }
    }
    let ls = a.least_squares(&b)?;
    let resid = a.dot(&ls.solution) - &b;
    let objective = resid.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt() / k as f64;
    Ok((ls.solution, objective))
}

/// Unconstrained linear inversion tomography. The estimate is the least
/// squares solution in the full matrix space and need not be a physical
/// density matrix.
pub struct FreeLsStateTomo {
    predictor: Array2<Complex<f64>>,
    dim: usize,
}

impl FreeLsStateTomo {
    pub fn new(operators: &[Array2<Complex<f64>>]) -> Result<Self> {
        let predictor = build_state_predictor(operators)?;
        let dim = operators[0].nrows();
        Ok(Self { predictor, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn predictor(&self) -> ArrayView2<Complex<f64>> {
        self.predictor.view()
    }

    pub fn predict(&self, rho: ArrayView2<Complex<f64>>) -> Result<Array1<f64>> {
        predict_means(self.predictor.view(), rho)
    }

    pub fn fit(
        &self,
        means: &[f64],
        variances: Option<&[f64]>,
        algorithm: LsAlgorithm,
    ) -> Result<FitResult> {
        let (x, objective) = free_fit(self.predictor.view(), means, variances, algorithm)?;
        Ok(FitResult {
            estimate: unvectorize(x.view())?,
            objective,
            status: FitStatus::Optimal,
            iterations: 0,
        })
    }
}

/// Physically constrained least squares tomography: the estimate is the
/// trace one positive semidefinite matrix minimizing the weighted residual
/// norm, found by an interior point solve over the real lift.
pub struct LsStateTomo {
    predictor: Array2<Complex<f64>>,
    dim: usize,
}

impl LsStateTomo {
    pub fn new(operators: &[Array2<Complex<f64>>]) -> Result<Self> {
        let predictor = build_state_predictor(operators)?;
        for (i, op) in operators.iter().enumerate() {
            if !is_hermitian(op.view(), HERMITIAN_TOL) {
                return Err(TomographyError::InvalidArgument(format!(
                    "operator {} is not hermitian",
                    i
                )));
            }
        }
        let dim = operators[0].nrows();
        Ok(Self { predictor, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn predict(&self, rho: ArrayView2<Complex<f64>>) -> Result<Array1<f64>> {
        predict_means(self.predictor.view(), rho)
    }

    pub fn fit(
        &self,
        means: &[f64],
        variances: &[f64],
        config: &SolverConfig,
    ) -> Result<FitResult> {
        let k = self.predictor.nrows();
        if means.len() != k {
            return Err(TomographyError::DimensionMismatch(format!(
                "predictor has {} rows but {} means were given",
                k,
                means.len()
            )));
        }
        check_variances(k, variances)?;
        let d = self.dim;
        let np = d * d;
        let u = np;
        let mut prog = ConeProgram::new(np + 1);
        prog.cost(u, 1.0);
        prog.row((0..d).map(|i| (i, 1.0)), 1.0);
        prog.cone(ZeroConeT(1));
        let rows: Vec<Vec<f64>> = self
            .predictor
            .outer_iter()
            .map(|r| real_parameter_row(d, r))
            .collect();
        let weights: Vec<f64> = variances.iter().map(|v| 1.0 / v.sqrt()).collect();
        weighted_residual_soc(&mut prog, &rows, means, &weights, u);
        hermitian_psd_block(&mut prog, d, None);
        let sol = prog.solve(config)?;
        let estimate = hermitian_from_params(d, &sol.x[..np])?;
        let predicted = self.predictor.dot(&vectorize(estimate.view()));
        let objective = predicted
            .iter()
            .zip(means)
            .zip(&weights)
            .map(|((p, &m), &w)| ((m - p.re) * w).powi(2))
            .sum::<f64>()
            .sqrt();
        Ok(FitResult {
            estimate,
            objective,
            status: sol.status,
            iterations: sol.iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{frob_norm, make_paulis, min_eigenvalue};
    use ndarray::array;

    fn c(re: f64, im: f64) -> Complex<f64> {
        Complex::new(re, im)
    }

    fn pauli_basis() -> Vec<Array2<Complex<f64>>> {
        let [x, y, z] = make_paulis();
        vec![Array2::eye(2), x, y, z]
    }

    fn test_state() -> Array2<Complex<f64>> {
        // trace one, positive definite, complex off-diagonal
        array![
            [c(0.7, 0.0), c(0.1, 0.2)],
            [c(0.1, -0.2), c(0.3, 0.0)]
        ]
    }

    #[test]
    fn test_dimension_accessors() {
        let free = FreeLsStateTomo::new(&pauli_basis()).unwrap();
        assert_eq!(free.dim(), 2);
        assert_eq!(free.predictor().dim(), (4, 4));
        let constrained = LsStateTomo::new(&pauli_basis()).unwrap();
        assert_eq!(constrained.dim(), 2);
    }

    #[test]
    fn test_free_fit_exact_recovery() {
        let tomo = FreeLsStateTomo::new(&pauli_basis()).unwrap();
        let rho = test_state();
        let means = tomo.predict(rho.view()).unwrap();
        let fit = tomo
            .fit(means.as_slice().unwrap(), None, LsAlgorithm::Ols)
            .unwrap();
        assert_eq!(fit.status, FitStatus::Optimal);
        assert_eq!(fit.iterations, 0);
        assert!(frob_norm((&fit.estimate - &rho).view()) < 1e-8);
        assert!(fit.objective < 1e-8);
    }

    #[test]
    fn test_free_fit_gls_uniform_weights_match_ols() {
        let tomo = FreeLsStateTomo::new(&pauli_basis()).unwrap();
        let means = [1.0, 0.3, -0.1, 0.4];
        let vars = [4.0, 4.0, 4.0, 4.0];
        let ols = tomo.fit(&means, None, LsAlgorithm::Ols).unwrap();
        let gls = tomo.fit(&means, Some(&vars), LsAlgorithm::Gls).unwrap();
        assert!(frob_norm((&ols.estimate - &gls.estimate).view()) < 1e-9);
    }

    #[test]
    fn test_free_fit_can_be_unphysical() {
        // No identity row: the minimum norm solution has trace zero.
        let [x, y, z] = make_paulis();
        let tomo = FreeLsStateTomo::new(&[x, y, z]).unwrap();
        let fit = tomo.fit(&[0.0, 0.0, 0.0], None, LsAlgorithm::Ols).unwrap();
        assert!(fit.estimate.diag().sum().norm() < 1e-9);
    }

    #[test]
    fn test_free_fit_argument_errors() {
        let tomo = FreeLsStateTomo::new(&pauli_basis()).unwrap();
        assert!(matches!(
            tomo.fit(&[1.0, 0.0], None, LsAlgorithm::Ols),
            Err(TomographyError::DimensionMismatch(_))
        ));
        assert!(matches!(
            tomo.fit(&[1.0, 0.0, 0.0, 0.0], None, LsAlgorithm::Gls),
            Err(TomographyError::InvalidArgument(_))
        ));
        let vars = [1.0, 1.0, 0.0, 1.0];
        assert!(matches!(
            tomo.fit(&[1.0, 0.0, 0.0, 0.0], Some(&vars), LsAlgorithm::Gls),
            Err(TomographyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("ols".parse::<LsAlgorithm>().unwrap(), LsAlgorithm::Ols);
        assert_eq!("GLS".parse::<LsAlgorithm>().unwrap(), LsAlgorithm::Gls);
        assert_eq!(LsAlgorithm::default(), LsAlgorithm::Ols);
        assert!(matches!(
            "levenberg".parse::<LsAlgorithm>(),
            Err(TomographyError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_constrained_fit_recovers_state() {
        let tomo = LsStateTomo::new(&pauli_basis()).unwrap();
        let rho = test_state();
        let means = tomo.predict(rho.view()).unwrap();
        let vars = [1.0; 4];
        let fit = tomo
            .fit(means.as_slice().unwrap(), &vars, &SolverConfig::default())
            .unwrap();
        assert_eq!(fit.status, FitStatus::Optimal);
        assert!(frob_norm((&fit.estimate - &rho).view()) < 1e-4);
        assert!((fit.estimate.diag().sum().re - 1.0).abs() < 1e-6);
        assert!(min_eigenvalue(fit.estimate.view()).unwrap() > -1e-7);
    }

    #[test]
    fn test_constrained_fit_stays_physical() {
        // Bloch vector of the data lies outside the sphere; the estimate
        // must still be a density matrix.
        let tomo = LsStateTomo::new(&pauli_basis()).unwrap();
        let means = [1.0, 0.9, 0.9, 0.9];
        let vars = [1.0; 4];
        let fit = tomo.fit(&means, &vars, &SolverConfig::default()).unwrap();
        assert_eq!(fit.status, FitStatus::Optimal);
        assert!((fit.estimate.diag().sum().re - 1.0).abs() < 1e-6);
        assert!(min_eigenvalue(fit.estimate.view()).unwrap() > -1e-7);
        assert!(fit.objective > 0.1);
    }

    #[test]
    fn test_constrained_fit_idempotent() {
        let tomo = LsStateTomo::new(&pauli_basis()).unwrap();
        let rho = test_state();
        let means = tomo.predict(rho.view()).unwrap();
        let vars = [0.5, 1.0, 2.0, 1.0];
        let first = tomo
            .fit(means.as_slice().unwrap(), &vars, &SolverConfig::default())
            .unwrap();
        let second = tomo
            .fit(means.as_slice().unwrap(), &vars, &SolverConfig::default())
            .unwrap();
        assert!(frob_norm((&first.estimate - &second.estimate).view()) < 1e-10);
    }

    #[test]
    fn test_constrained_rejects_non_hermitian() {
        let raising = array![[c(0.0, 0.0), c(1.0, 0.0)], [c(0.0, 0.0), c(0.0, 0.0)]];
        assert!(matches!(
            LsStateTomo::new(&[raising]),
            Err(TomographyError::InvalidArgument(_))
        ));
    }
}
