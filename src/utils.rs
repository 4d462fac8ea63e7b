use crate::error::{Result, TomographyError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ShapeBuilder};
use ndarray_linalg::{Eigh, UPLO};
use num_complex::Complex;
use num_traits::{One, Zero};

/// Column-major vectorization: `vectorize(m)[i + rows * j] == m[(i, j)]`.
pub fn vectorize(m: ArrayView2<Complex<f64>>) -> Array1<Complex<f64>> {
    Array1::from_iter(m.t().iter().copied())
}

/// Inverse of [`vectorize`] for square matrices.
pub fn unvectorize(v: ArrayView1<Complex<f64>>) -> Result<Array2<Complex<f64>>> {
    let d = perfect_sqrt(v.len()).ok_or_else(|| {
        TomographyError::DimensionMismatch(format!(
            "cannot reshape a vector of length {} into a square matrix",
            v.len()
        ))
    })?;
    Ok(Array2::from_shape_vec((d, d).f(), v.to_vec()).unwrap())
}

pub(crate) fn perfect_sqrt(n: usize) -> Option<usize> {
    let r = (n as f64).sqrt().round() as usize;
    if r * r == n {
        Some(r)
    } else {
        None
    }
}

fn square_superop_dim(m: ArrayView2<Complex<f64>>) -> Result<usize> {
    if m.nrows() != m.ncols() {
        return Err(TomographyError::DimensionMismatch(format!(
            "superoperator must be square, got {}x{}",
            m.nrows(),
            m.ncols()
        )));
    }
    perfect_sqrt(m.nrows()).ok_or_else(|| {
        TomographyError::DimensionMismatch(format!(
            "superoperator side {} is not a perfect square",
            m.nrows()
        ))
    })
}

/// Reshuffle a Liouville superoperator into the corresponding Choi matrix.
///
/// Both live on the d^2 dimensional space; the index shuffle pairs the
/// column-major vectorization with the input (x) output Choi ordering:
/// `choi[(p*d + m, q*d + n)] = liou[(m + d*n, p + d*q)]`.
pub fn liou2choi(l: ArrayView2<Complex<f64>>) -> Result<Array2<Complex<f64>>> {
    let d = square_superop_dim(l)?;
    Ok(liou2choi_unchecked(l, d))
}

/// Inverse reshuffle of [`liou2choi`].
pub fn choi2liou(c: ArrayView2<Complex<f64>>) -> Result<Array2<Complex<f64>>> {
    let d = square_superop_dim(c)?;
    Ok(choi2liou_unchecked(c, d))
}

pub(crate) fn liou2choi_unchecked(l: ArrayView2<Complex<f64>>, d: usize) -> Array2<Complex<f64>> {
    let dd = d * d;
    let mut c = Array2::zeros((dd, dd));
    for q in 0..d {
        for p in 0..d {
            for n in 0..d {
                for m in 0..d {
                    c[(p * d + m, q * d + n)] = l[(m + d * n, p + d * q)];
                }
            }
        }
    }
    c
}

pub(crate) fn choi2liou_unchecked(c: ArrayView2<Complex<f64>>, d: usize) -> Array2<Complex<f64>> {
    let dd = d * d;
    let mut l = Array2::zeros((dd, dd));
    for q in 0..d {
        for p in 0..d {
            for n in 0..d {
                for m in 0..d {
                    l[(m + d * n, p + d * q)] = c[(p * d + m, q * d + n)];
                }
            }
        }
    }
    l
}

/// Lift a complex matrix H = R + iI to the real block matrix [[R, I], [-I, R]].
///
/// For Hermitian H the lifted matrix is symmetric and carries the same
/// spectrum with every eigenvalue doubled in multiplicity.
pub fn realify(m: ArrayView2<Complex<f64>>) -> Array2<f64> {
    let (rows, cols) = m.dim();
    let mut out = Array2::zeros((2 * rows, 2 * cols));
    for i in 0..rows {
        for j in 0..cols {
            let z = m[(i, j)];
            out[(i, j)] = z.re;
            out[(i + rows, j + cols)] = z.re;
            out[(i, j + cols)] = z.im;
            out[(i + rows, j)] = -z.im;
        }
    }
    out
}

/// Inverse of [`realify`]: reads R from the upper-left and I from the
/// upper-right block.
pub fn complexify(m: ArrayView2<f64>) -> Result<Array2<Complex<f64>>> {
    let (rows, cols) = m.dim();
    if rows != cols || rows % 2 != 0 {
        return Err(TomographyError::DimensionMismatch(format!(
            "expected a square matrix with even side, got {}x{}",
            rows, cols
        )));
    }
    let d = rows / 2;
    Ok(Array2::from_shape_fn((d, d), |(i, j)| {
        Complex::new(m[(i, j)], m[(i, j + d)])
    }))
}

/// Offset of the (re, im) parameter pair of the upper off-diagonal entry
/// (i, j), i < j, in the real Hermitian parameterization. The layout is the
/// d diagonal entries first, then the upper pairs in column-major order.
pub fn pair_offset(d: usize, i: usize, j: usize) -> usize {
    debug_assert!(i < j && j < d);
    d + 2 * (j * (j - 1) / 2 + i)
}

/// Assemble a Hermitian matrix from its d^2 real parameters.
pub fn hermitian_from_params(d: usize, params: &[f64]) -> Result<Array2<Complex<f64>>> {
    if params.len() != d * d {
        return Err(TomographyError::DimensionMismatch(format!(
            "expected {} parameters for a {}x{} hermitian matrix, got {}",
            d * d,
            d,
            d,
            params.len()
        )));
    }
    let mut m = Array2::zeros((d, d));
    for k in 0..d {
        m[(k, k)] = Complex::new(params[k], 0.0);
    }
    for j in 1..d {
        for i in 0..j {
            let off = pair_offset(d, i, j);
            let z = Complex::new(params[off], params[off + 1]);
            m[(i, j)] = z;
            m[(j, i)] = z.conj();
        }
    }
    Ok(m)
}

/// Inverse of [`hermitian_from_params`]. Off-diagonal entries are
/// symmetrized so small anti-hermitian noise drops out.
pub fn params_from_hermitian(m: ArrayView2<Complex<f64>>) -> Vec<f64> {
    let d = m.nrows();
    debug_assert_eq!(d, m.ncols());
    let mut params = vec![0.0; d * d];
    for k in 0..d {
        params[k] = m[(k, k)].re;
    }
    for j in 1..d {
        for i in 0..j {
            let z = (m[(i, j)] + m[(j, i)].conj()) * 0.5;
            let off = pair_offset(d, i, j);
            params[off] = z.re;
            params[off + 1] = z.im;
        }
    }
    params
}

/// Rewrite a complex predictor row as real coefficients over the Hermitian
/// parameterization, so that `dot(real_row, params_from_hermitian(rho))`
/// equals the real part of `dot(row, vectorize(rho))`.
pub fn real_parameter_row(d: usize, row: ArrayView1<Complex<f64>>) -> Vec<f64> {
    debug_assert_eq!(row.len(), d * d);
    let mut out = vec![0.0; d * d];
    for k in 0..d {
        out[k] = row[k + d * k].re;
    }
    for j in 1..d {
        for i in 0..j {
            let pij = row[i + d * j];
            let pji = row[j + d * i];
            let off = pair_offset(d, i, j);
            out[off] = (pij + pji).re;
            out[off + 1] = pji.im - pij.im;
        }
    }
    out
}

/// The three Pauli matrices (x, y, z).
pub fn make_paulis() -> [Array2<Complex<f64>>; 3] {
    let o = Complex::<f64>::zero();
    let l = Complex::<f64>::one();
    let i = Complex::<f64>::i();
    [
        Array2::from_shape_vec((2, 2), vec![o, l, l, o]).unwrap(),
        Array2::from_shape_vec((2, 2), vec![o, -i, i, o]).unwrap(),
        Array2::from_shape_vec((2, 2), vec![l, o, o, -l]).unwrap(),
    ]
}

/// tr(a b) without forming the product.
pub fn trace_product(a: ArrayView2<Complex<f64>>, b: ArrayView2<Complex<f64>>) -> Complex<f64> {
    debug_assert_eq!(a.ncols(), b.nrows());
    debug_assert_eq!(b.ncols(), a.nrows());
    let mut acc = Complex::zero();
    for i in 0..a.nrows() {
        for j in 0..a.ncols() {
            acc += a[(i, j)] * b[(j, i)];
        }
    }
    acc
}

pub fn is_hermitian(m: ArrayView2<Complex<f64>>, tol: f64) -> bool {
    if m.nrows() != m.ncols() {
        return false;
    }
    for i in 0..m.nrows() {
        for j in 0..=i {
            if (m[(i, j)] - m[(j, i)].conj()).norm() > tol {
                return false;
            }
        }
    }
    true
}

/// Smallest eigenvalue of a Hermitian matrix.
pub fn min_eigenvalue(m: ArrayView2<Complex<f64>>) -> Result<f64> {
    let (vals, _) = m.eigh(UPLO::Upper)?;
    Ok(vals.iter().copied().fold(f64::INFINITY, f64::min))
}

pub fn frob_norm(m: ArrayView2<Complex<f64>>) -> f64 {
    m.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt()
}

/// Matrix logarithm of a Hermitian positive matrix via its eigensystem.
/// Eigenvalues are floored at a tiny positive constant so rank deficient
/// inputs stay finite.
pub fn hermitian_log(m: ArrayView2<Complex<f64>>) -> Result<Array2<Complex<f64>>> {
    let (vals, vecs) = m.eigh(UPLO::Upper)?;
    let logs = Array2::from_diag(&vals.mapv(|v| Complex::new(v.max(1e-12).ln(), 0.0)));
    let adj = vecs.t().mapv(|z| z.conj());
    Ok(vecs.dot(&logs).dot(&adj))
}
