use crate::conic::{hermitian_psd_block, weighted_residual_soc, ConeProgram, SolverConfig};
use crate::error::{FitStatus, Result, TomographyError};
use crate::lstsq::{check_variances, free_fit, LsAlgorithm};
use crate::predictor::{build_process_predictor, predict_means};
use crate::ptrace::{sop_apply, trb_sop};
use crate::utils::{
    hermitian_from_params, is_hermitian, params_from_hermitian, perfect_sqrt, real_parameter_row,
    unvectorize, vectorize,
};
use crate::FitResult;
use clarabel::solver::SupportedConeT::ZeroConeT;
use ndarray::{Array1, Array2, ArrayView2};
use num_complex::Complex;

const HERMITIAN_TOL: f64 = 1e-9;

/// Process tomography through the Choi matrix of the channel.
///
/// The predictor pairs every observable with every preparation, observable
/// loop outermost, so the expected means follow the same ordering. Fits
/// return the Choi matrix on the input (x) output space; apply
/// [`choi2liou`](crate::utils::choi2liou) to get the superoperator back.
pub struct ProcessTomo {
    predictor: Array2<Complex<f64>>,
    dim: usize,
}

impl ProcessTomo {
    pub fn new(
        observables: &[Array2<Complex<f64>>],
        preparations: &[Array2<Complex<f64>>],
    ) -> Result<Self> {
        let predictor = build_process_predictor(observables, preparations)?;
        for (i, op) in observables.iter().enumerate() {
            if !is_hermitian(op.view(), HERMITIAN_TOL) {
                return Err(TomographyError::InvalidArgument(format!(
                    "observable {} is not hermitian",
                    i
                )));
            }
        }
        for (i, prep) in preparations.iter().enumerate() {
            if !is_hermitian(prep.view(), HERMITIAN_TOL) {
                return Err(TomographyError::InvalidArgument(format!(
                    "preparation {} is not hermitian",
                    i
                )));
            }
        }
        let dim = observables[0].nrows();
        Ok(Self { predictor, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn predictor(&self) -> ArrayView2<Complex<f64>> {
        self.predictor.view()
    }

    /// Expected means of every (observable, preparation) pair under a
    /// channel given as a Choi matrix.
    pub fn predict(&self, choi: ArrayView2<Complex<f64>>) -> Result<Array1<f64>> {
        predict_means(self.predictor.view(), choi)
    }

    /// Physically constrained fit; see [`qpt_ml`].
    pub fn fit(
        &self,
        means: &[f64],
        variances: &[f64],
        config: &SolverConfig,
    ) -> Result<FitResult> {
        qpt_ml(self.predictor.view(), means, variances, config)
    }

    /// Unconstrained least squares fit of the Choi matrix. The estimate
    /// need not describe a completely positive or trace preserving channel.
    pub fn fit_free(
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

/// Constrained least squares process tomography on a prebuilt predictor.
///
/// Minimizes the weighted residual over Choi matrices that are positive
/// semidefinite (complete positivity) and whose partial trace over the
/// output factor equals the identity (trace preservation). The unit trace
/// of the channel follows from the partial trace rows, so no separate
/// normalization constraint is added.
pub fn qpt_ml(
    predictor: ArrayView2<Complex<f64>>,
    means: &[f64],
    variances: &[f64],
    config: &SolverConfig,
) -> Result<FitResult> {
    let k = predictor.nrows();
    let big = perfect_sqrt(predictor.ncols()).ok_or_else(|| {
        TomographyError::DimensionMismatch(format!(
            "predictor has {} columns, expected the square of a Choi dimension",
            predictor.ncols()
        ))
    })?;
    let d = perfect_sqrt(big).ok_or_else(|| {
        TomographyError::DimensionMismatch(format!(
            "Choi dimension {} is not a perfect square",
            big
        ))
    })?;
    if means.len() != k {
        return Err(TomographyError::DimensionMismatch(format!(
            "predictor has {} rows but {} means were given",
            k,
            means.len()
        )));
    }
    check_variances(k, variances)?;
    let np = big * big;
    let u = np;
    let mut prog = ConeProgram::new(np + 1);
    prog.cost(u, 1.0);
    let tp = trace_preserving_rows(d)?;
    for (coeffs, rhs) in &tp {
        prog.row(
            coeffs
                .iter()
                .enumerate()
                .filter(|&(_, &c)| c != 0.0)
                .map(|(j, &c)| (j, c)),
            *rhs,
        );
    }
    prog.cone(ZeroConeT(tp.len()));
    let rows: Vec<Vec<f64>> = predictor
        .outer_iter()
        .map(|r| real_parameter_row(big, r))
        .collect();
    let weights: Vec<f64> = variances.iter().map(|v| 1.0 / v.sqrt()).collect();
    weighted_residual_soc(&mut prog, &rows, means, &weights, u);
    hermitian_psd_block(&mut prog, big, None);
    let sol = prog.solve(config)?;
    let estimate = hermitian_from_params(big, &sol.x[..np])?;
    let predicted = predictor.dot(&vectorize(estimate.view()));
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

/// Equality rows pinning the partial trace of the parameterized Choi matrix
/// to the identity, one row per real parameter of the reduced matrix.
fn trace_preserving_rows(d: usize) -> Result<Vec<(Vec<f64>, f64)>> {
    let big = d * d;
    let np = big * big;
    let sop = trb_sop(d, d)?;
    let mut columns = Vec::with_capacity(np);
    let mut unit = vec![0.0; np];
    for k in 0..np {
        unit[k] = 1.0;
        let plane = hermitian_from_params(big, &unit)?;
        unit[k] = 0.0;
        let traced = sop_apply(&sop, vectorize(plane.view()).view());
        columns.push(params_from_hermitian(unvectorize(traced.view())?.view()));
    }
    let target = params_from_hermitian(Array2::<Complex<f64>>::eye(d).view());
    Ok((0..d * d)
        .map(|r| {
            let coeffs: Vec<f64> = columns.iter().map(|col| col[r]).collect();
            (coeffs, target[r])
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{frob_norm, make_paulis, min_eigenvalue, trace_product};
    use ndarray::array;

    fn c(re: f64, im: f64) -> Complex<f64> {
        Complex::new(re, im)
    }

    fn observables() -> Vec<Array2<Complex<f64>>> {
        let [x, y, z] = make_paulis();
        vec![Array2::eye(2), x, y, z]
    }

    fn preparations() -> Vec<Array2<Complex<f64>>> {
        let eye = Array2::<Complex<f64>>::eye(2);
        let [x, y, _] = make_paulis();
        vec![
            array![[c(1.0, 0.0), c(0.0, 0.0)], [c(0.0, 0.0), c(0.0, 0.0)]],
            array![[c(0.0, 0.0), c(0.0, 0.0)], [c(0.0, 0.0), c(1.0, 0.0)]],
            (&eye + &x) * 0.5,
            (&eye + &y) * 0.5,
        ]
    }

    fn identity_choi() -> Array2<Complex<f64>> {
        let mut choi = Array2::zeros((4, 4));
        for r in [0, 3] {
            for col in [0, 3] {
                choi[(r, col)] = c(1.0, 0.0);
            }
        }
        choi
    }

    fn depolarizing_choi(p: f64) -> Array2<Complex<f64>> {
        let mut choi = identity_choi() * (1.0 - p);
        for k in 0..4 {
            choi[(k, k)] += c(p * 0.5, 0.0);
        }
        choi
    }

    #[test]
    fn test_predict_depolarizing_formula() {
        let tomo = ProcessTomo::new(&observables(), &preparations()).unwrap();
        let choi = depolarizing_choi(0.3);
        let means = tomo.predict(choi.view()).unwrap();
        let mut idx = 0;
        for o in &observables() {
            for p in &preparations() {
                let want = 0.7 * trace_product(o.view(), p.view()).re
                    + 0.15 * o.diag().sum().re * p.diag().sum().re;
                assert!((means[idx] - want).abs() < 1e-12);
                idx += 1;
            }
        }
    }

    #[test]
    fn test_identity_channel_free_recovery() {
        let tomo = ProcessTomo::new(&observables(), &preparations()).unwrap();
        let choi = identity_choi();
        let means = tomo.predict(choi.view()).unwrap().to_vec();
        let fit = tomo.fit_free(&means, None, LsAlgorithm::Ols).unwrap();
        assert_eq!(fit.status, FitStatus::Optimal);
        assert!(frob_norm((&fit.estimate - &choi).view()) < 1e-6);
    }

    #[test]
    fn test_identity_channel_constrained_recovery() {
        let tomo = ProcessTomo::new(&observables(), &preparations()).unwrap();
        let choi = identity_choi();
        let means = tomo.predict(choi.view()).unwrap().to_vec();
        let fit = tomo
            .fit(&means, &vec![1.0; 16], &SolverConfig::default())
            .unwrap();
        assert_eq!(fit.status, FitStatus::Optimal);
        assert!(frob_norm((&fit.estimate - &choi).view()) < 1e-3);
        let traced = sop_apply(
            &trb_sop(2, 2).unwrap(),
            vectorize(fit.estimate.view()).view(),
        );
        let reduced = unvectorize(traced.view()).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                let want = if i == j { 1.0 } else { 0.0 };
                assert!((reduced[(i, j)] - c(want, 0.0)).norm() < 1e-5);
            }
        }
    }

    #[test]
    fn test_fit_delegates_to_qpt_ml() {
        let tomo = ProcessTomo::new(&observables(), &preparations()).unwrap();
        assert_eq!(tomo.dim(), 2);
        let choi = depolarizing_choi(0.2);
        let means = tomo.predict(choi.view()).unwrap().to_vec();
        let vars = vec![1.0; 16];
        let cfg = SolverConfig::default();
        let wrapped = tomo.fit(&means, &vars, &cfg).unwrap();
        let direct = qpt_ml(tomo.predictor(), &means, &vars, &cfg).unwrap();
        assert_eq!(wrapped.status, direct.status);
        assert!(frob_norm((&wrapped.estimate - &direct.estimate).view()) < 1e-10);
        assert!((wrapped.objective - direct.objective).abs() < 1e-12);
    }

    #[test]
    fn test_depolarizing_recovery() {
        let tomo = ProcessTomo::new(&observables(), &preparations()).unwrap();
        let choi = depolarizing_choi(0.3);
        let means = tomo.predict(choi.view()).unwrap().to_vec();
        let fit = tomo
            .fit(&means, &vec![1.0; 16], &SolverConfig::default())
            .unwrap();
        assert_eq!(fit.status, FitStatus::Optimal);
        assert!(frob_norm((&fit.estimate - &choi).view()) < 1e-3);
        assert!(min_eigenvalue(fit.estimate.view()).unwrap() > 0.1);
    }

    #[test]
    fn test_qpt_ml_argument_errors() {
        let cfg = SolverConfig::default();
        let bad_cols = Array2::<Complex<f64>>::zeros((2, 9));
        assert!(matches!(
            qpt_ml(bad_cols.view(), &[0.0; 2], &[1.0; 2], &cfg),
            Err(TomographyError::DimensionMismatch(_))
        ));
        let pred = Array2::<Complex<f64>>::zeros((3, 16));
        assert!(matches!(
            qpt_ml(pred.view(), &[0.0; 2], &[1.0; 3], &cfg),
            Err(TomographyError::DimensionMismatch(_))
        ));
        assert!(matches!(
            qpt_ml(pred.view(), &[0.0; 3], &[1.0, 0.0, 1.0], &cfg),
            Err(TomographyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_new_validation() {
        let obs = observables();
        let preps3 = vec![Array2::<Complex<f64>>::eye(3)];
        assert!(matches!(
            ProcessTomo::new(&obs, &preps3),
            Err(TomographyError::DimensionMismatch(_))
        ));
        assert!(matches!(
            ProcessTomo::new(&[], &preparations()),
            Err(TomographyError::InvalidArgument(_))
        ));
        let raising = array![[c(0.0, 0.0), c(1.0, 0.0)], [c(0.0, 0.0), c(0.0, 0.0)]];
        assert!(matches!(
            ProcessTomo::new(&obs, &[raising]),
            Err(TomographyError::InvalidArgument(_))
        ));
    }
}
