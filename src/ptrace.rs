use crate::error::{Result, TomographyError};
use ndarray::{Array1, ArrayView1};
use num_complex::Complex;
use num_traits::Zero;
use sprs::{CsMat, TriMat};

/// Superoperator tracing out a db dimensional ancilla from a composite
/// da*db system: `trb_sop(da, db) . vec(m) == vec(tr_ancilla(m))` for any
/// (da*db)x(da*db) matrix m under column-major vectorization, with the
/// ancilla as the second tensor factor.
pub fn trb_sop(da: usize, db: usize) -> Result<CsMat<f64>> {
    if da == 0 || db == 0 {
        return Err(TomographyError::InvalidArgument(
            "partial trace dimensions must be positive".to_string(),
        ));
    }
    let d = da * db;
    let mut a = TriMat::new((da * da, d * d));
    for j in 0..da {
        for i in 0..da {
            let row = i + da * j;
            for k in 0..db {
                // vec index of the ((i, k), (j, k)) entry of the composite
                let col = (i * db + k) + d * (j * db + k);
                a.add_triplet(row, col, 1.0);
            }
        }
    }
    Ok(a.to_csr())
}

/// Apply a real sparse superoperator to a complex vector row by row.
pub fn sop_apply(s: &CsMat<f64>, v: ArrayView1<Complex<f64>>) -> Array1<Complex<f64>> {
    debug_assert_eq!(s.cols(), v.len());
    let mut out = Array1::zeros(s.rows());
    for (r, row) in s.outer_iterator().enumerate() {
        let mut acc = Complex::zero();
        for (c, val) in row.iter() {
            acc += v[c] * *val;
        }
        out[r] = acc;
    }
    out
}
