use crate::error::{Result, TomographyError};
use crate::utils::{liou2choi_unchecked, vectorize};
use ndarray::{Array1, Array2, ArrayView2};
use num_complex::Complex;
use rayon::prelude::*;

fn check_family(name: &str, ops: &[Array2<Complex<f64>>]) -> Result<usize> {
    let first = ops.first().ok_or_else(|| {
        TomographyError::InvalidArgument(format!("at least one {} is required", name))
    })?;
    let d = first.nrows();
    if d == 0 {
        return Err(TomographyError::InvalidArgument(format!(
            "{} matrices must be nonempty",
            name
        )));
    }
    for (i, op) in ops.iter().enumerate() {
        if op.nrows() != d || op.ncols() != d {
            return Err(TomographyError::DimensionMismatch(format!(
                "{} {} is {}x{}, expected {}x{}",
                name,
                i,
                op.nrows(),
                op.ncols(),
                d,
                d
            )));
        }
    }
    Ok(d)
}

/// One predictor row per measurement operator, the conjugated column-major
/// vectorization, so `row . vec(rho) == tr(op rho)` for Hermitian operators.
pub fn build_state_predictor(operators: &[Array2<Complex<f64>>]) -> Result<Array2<Complex<f64>>> {
    let d = check_family("operator", operators)?;
    let mut pred = Array2::zeros((operators.len(), d * d));
    pred.outer_iter_mut()
        .into_par_iter()
        .zip(operators.par_iter())
        .for_each(|(mut row, op)| {
            for j in 0..d {
                for i in 0..d {
                    row[i + d * j] = op[(i, j)].conj();
                }
            }
        });
    Ok(pred)
}

/// One predictor row per (operator, preparation) pair with the operator loop
/// outermost. Each row is the conjugated vectorization of the Choi transform
/// of vec(op) vec(prep)^dag, so dotting it with a vectorized Choi matrix
/// predicts tr(op channel(prep)).
pub fn build_process_predictor(
    operators: &[Array2<Complex<f64>>],
    preparations: &[Array2<Complex<f64>>],
) -> Result<Array2<Complex<f64>>> {
    let d = check_family("operator", operators)?;
    let dp = check_family("preparation", preparations)?;
    if d != dp {
        return Err(TomographyError::DimensionMismatch(format!(
            "operators act on dimension {} but preparations on {}",
            d, dp
        )));
    }
    let dd = d * d;
    let pairs: Vec<(&Array2<Complex<f64>>, &Array2<Complex<f64>>)> = operators
        .iter()
        .flat_map(|o| preparations.iter().map(move |p| (o, p)))
        .collect();
    let mut pred = Array2::zeros((pairs.len(), dd * dd));
    pred.outer_iter_mut()
        .into_par_iter()
        .zip(pairs.par_iter())
        .for_each(|(mut row, (op, prep))| {
            let vo = vectorize(op.view());
            let vp = vectorize(prep.view());
            let mut liou = Array2::zeros((dd, dd));
            for b in 0..dd {
                for a in 0..dd {
                    liou[(a, b)] = vo[a] * vp[b].conj();
                }
            }
            let choi = liou2choi_unchecked(liou.view(), d);
            for c in 0..dd {
                for r in 0..dd {
                    row[r + dd * c] = choi[(r, c)].conj();
                }
            }
        });
    Ok(pred)
}

/// Expected measurement outcomes of a state or Choi matrix under a predictor.
pub fn predict_means(
    predictor: ArrayView2<Complex<f64>>,
    state: ArrayView2<Complex<f64>>,
) -> Result<Array1<f64>> {
    let v = vectorize(state);
    if predictor.ncols() != v.len() {
        return Err(TomographyError::DimensionMismatch(format!(
            "predictor has {} columns but the state vectorizes to length {}",
            predictor.ncols(),
            v.len()
        )));
    }
    Ok(predictor.dot(&v).mapv(|z| z.re))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{make_paulis, trace_product};
    use ndarray::array;
    use num_complex::Complex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn c(re: f64, im: f64) -> Complex<f64> {
        Complex::new(re, im)
    }

    fn random_hermitian(rng: &mut StdRng, d: usize) -> Array2<Complex<f64>> {
        let a = Array2::from_shape_fn((d, d), |_| {
            Complex::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
        });
        let adj = a.t().mapv(|z| z.conj());
        (&a + &adj) * 0.5
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

    #[test]
    fn test_state_predictor_shape_and_values() {
        let [x, y, z] = make_paulis();
        let pred = build_state_predictor(&[x, y, z]).unwrap();
        assert_eq!(pred.dim(), (3, 4));
        let ket0 = array![[c(1.0, 0.0), c(0.0, 0.0)], [c(0.0, 0.0), c(0.0, 0.0)]];
        let means = predict_means(pred.view(), ket0.view()).unwrap();
        assert!(means[0].abs() < 1e-12);
        assert!(means[1].abs() < 1e-12);
        assert!((means[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_state_predictor_matches_trace() {
        let mut rng = StdRng::seed_from_u64(17);
        let ops: Vec<_> = (0..5).map(|_| random_hermitian(&mut rng, 3)).collect();
        let rho = random_hermitian(&mut rng, 3);
        let pred = build_state_predictor(&ops).unwrap();
        let means = predict_means(pred.view(), rho.view()).unwrap();
        for (op, &m) in ops.iter().zip(means.iter()) {
            let want = trace_product(op.view(), rho.view()).re;
            assert!((m - want).abs() < 1e-10);
        }
    }

    #[test]
    fn test_state_predictor_dimension_mismatch() {
        let a = Array2::<Complex<f64>>::eye(2);
        let b = Array2::<Complex<f64>>::eye(3);
        assert!(matches!(
            build_state_predictor(&[a, b]),
            Err(TomographyError::DimensionMismatch(_))
        ));
        assert!(matches!(
            build_state_predictor(&[]),
            Err(TomographyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_process_predictor_identity_channel() {
        let mut rng = StdRng::seed_from_u64(19);
        let obs: Vec<_> = (0..4).map(|_| random_hermitian(&mut rng, 2)).collect();
        let preps: Vec<_> = (0..3).map(|_| random_hermitian(&mut rng, 2)).collect();
        let pred = build_process_predictor(&obs, &preps).unwrap();
        assert_eq!(pred.dim(), (12, 16));
        let means = predict_means(pred.view(), identity_choi().view()).unwrap();
        // On the identity channel a pair (op, prep) predicts tr(op prep).
        for (k, op) in obs.iter().enumerate() {
            for (l, prep) in preps.iter().enumerate() {
                let want = trace_product(op.view(), prep.view()).re;
                assert!((means[k * preps.len() + l] - want).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_process_predictor_operator_outer_ordering() {
        let eye = Array2::<Complex<f64>>::eye(2);
        let [_, _, z] = make_paulis();
        let plus = array![[c(0.5, 0.0), c(0.5, 0.0)], [c(0.5, 0.0), c(0.5, 0.0)]];
        let ket0 = array![[c(1.0, 0.0), c(0.0, 0.0)], [c(0.0, 0.0), c(0.0, 0.0)]];
        let pred = build_process_predictor(&[eye, z], &[plus, ket0]).unwrap();
        let means = predict_means(pred.view(), identity_choi().view()).unwrap();
        let want = [1.0, 1.0, 0.0, 1.0];
        for (m, w) in means.iter().zip(want) {
            assert!((m - w).abs() < 1e-10);
        }
    }

    #[test]
    fn test_process_predictor_dimension_mismatch() {
        let a = Array2::<Complex<f64>>::eye(2);
        let b = Array2::<Complex<f64>>::eye(3);
        assert!(matches!(
            build_process_predictor(&[a], &[b]),
            Err(TomographyError::DimensionMismatch(_))
        ));
    }
}
