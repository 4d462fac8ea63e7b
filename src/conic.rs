//! Translation of the crate's fitting problems into sparse conic form.
//!
//! Everything the solver sees is assembled here: the real lift of the
//! Hermitian parameterization, the svec rows of positive semidefinite
//! blocks, and the mapping of solver termination states back onto
//! [`FitStatus`]. The rest of the crate only handles [`SolverConfig`].

use crate::error::{FitStatus, Result, TomographyError};
use crate::utils::pair_offset;
use clarabel::algebra::CscMatrix;
use clarabel::solver::SupportedConeT::{self, PSDTriangleConeT, SecondOrderConeT};
use clarabel::solver::{DefaultSettings, DefaultSolver, IPSolver, SolverStatus};
use serde::{Deserialize, Serialize};
use sprs::TriMat;
use std::f64::consts::SQRT_2;
use tracing::debug;

/// Interior point solver knobs, passed explicitly to every constrained fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Duality gap and feasibility tolerance.
    pub tol: f64,
    pub max_iter: u32,
    pub verbose: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            max_iter: 200,
            verbose: false,
        }
    }
}

/// Incrementally built conic program `min q.x  s.t.  A x + s = b, s in K`.
///
/// Rows are appended through [`row`](ConeProgram::row) and grouped by a
/// following [`cone`](ConeProgram::cone) call, in order.
pub(crate) struct ConeProgram {
    nvars: usize,
    q: Vec<f64>,
    rows: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
    b: Vec<f64>,
    cones: Vec<SupportedConeT<f64>>,
}

pub(crate) struct ConeSolution {
    pub x: Vec<f64>,
    pub status: FitStatus,
    pub iterations: usize,
}

impl ConeProgram {
    pub(crate) fn new(nvars: usize) -> Self {
        Self {
            nvars,
            q: vec![0.0; nvars],
            rows: Vec::new(),
            cols: Vec::new(),
            vals: Vec::new(),
            b: Vec::new(),
            cones: Vec::new(),
        }
    }

    pub(crate) fn cost(&mut self, var: usize, coeff: f64) {
        self.q[var] += coeff;
    }

    /// Append one row of A x + s = b; the slack is `b - sum(coeff * x)`.
    pub(crate) fn row<I>(&mut self, terms: I, rhs: f64)
    where
        I: IntoIterator<Item = (usize, f64)>,
    {
        let r = self.b.len();
        for (c, v) in terms {
            debug_assert!(c < self.nvars);
            if v != 0.0 {
                self.rows.push(r);
                self.cols.push(c);
                self.vals.push(v);
            }
        }
        self.b.push(rhs);
    }

    pub(crate) fn cone(&mut self, cone: SupportedConeT<f64>) {
        self.cones.push(cone);
    }

    pub(crate) fn solve(&self, config: &SolverConfig) -> Result<ConeSolution> {
        if config.tol <= 0.0 {
            return Err(TomographyError::InvalidArgument(
                "solver tolerance must be positive".to_string(),
            ));
        }
        let m = self.b.len();
        let covered: usize = self.cones.iter().map(cone_rows).sum();
        if covered != m {
            return Err(TomographyError::Solver(format!(
                "cones cover {} slack rows but {} were assembled",
                covered, m
            )));
        }
        let tri = TriMat::from_triplets(
            (m, self.nvars),
            self.rows.clone(),
            self.cols.clone(),
            self.vals.clone(),
        );
        let csc = tri.to_csc::<usize>();
        let a = CscMatrix::new(
            m,
            self.nvars,
            csc.indptr().to_proper().to_vec(),
            csc.indices().to_vec(),
            csc.data().to_vec(),
        );
        let p = CscMatrix::zeros((self.nvars, self.nvars));
        let settings = DefaultSettings {
            max_iter: config.max_iter,
            verbose: config.verbose,
            tol_gap_abs: config.tol,
            tol_gap_rel: config.tol,
            tol_feas: config.tol,
            ..Default::default()
        };
        let mut solver = DefaultSolver::new(&p, &self.q, &a, &self.b, &self.cones, settings);
        solver.solve();
        let status = map_status(solver.solution.status);
        let iterations = solver.info.iterations as usize;
        debug!(?status, iterations, "conic solve finished");
        Ok(ConeSolution {
            x: solver.solution.x.clone(),
            status,
            iterations,
        })
    }
}

fn cone_rows(cone: &SupportedConeT<f64>) -> usize {
    match cone {
        SupportedConeT::ZeroConeT(n)
        | SupportedConeT::NonnegativeConeT(n)
        | SupportedConeT::SecondOrderConeT(n) => *n,
        SupportedConeT::ExponentialConeT() => 3,
        SupportedConeT::PSDTriangleConeT(n) => n * (n + 1) / 2,
        _ => 0,
    }
}

fn map_status(status: SolverStatus) -> FitStatus {
    match status {
        SolverStatus::Solved | SolverStatus::AlmostSolved => FitStatus::Optimal,
        SolverStatus::MaxIterations | SolverStatus::MaxTime => FitStatus::MaxIter,
        SolverStatus::PrimalInfeasible
        | SolverStatus::DualInfeasible
        | SolverStatus::AlmostPrimalInfeasible
        | SolverStatus::AlmostDualInfeasible => FitStatus::Infeasible,
        _ => FitStatus::Failed,
    }
}

/// Index of entry (r, c), r <= c, in the column-major upper-triangle svec
/// ordering used by the PSD cone.
pub(crate) fn svec_index(r: usize, c: usize) -> usize {
    debug_assert!(r <= c);
    c * (c + 1) / 2 + r
}

/// Push the svec rows constraining the real lift [[R, I], [-I, R]] of the
/// Hermitian matrix described by parameters 0..d^2 to be positive
/// semidefinite. With `shift` set to a variable t the constraint becomes
/// lift - t id >= 0, which bounds t by the smallest eigenvalue.
pub(crate) fn hermitian_psd_block(prog: &mut ConeProgram, d: usize, shift: Option<usize>) {
    let n = 2 * d;
    let mut entries: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n * (n + 1) / 2];
    for k in 0..d {
        entries[svec_index(k, k)].push((k, -1.0));
        entries[svec_index(k + d, k + d)].push((k, -1.0));
    }
    for j in 1..d {
        for i in 0..j {
            let re = pair_offset(d, i, j);
            let im = re + 1;
            entries[svec_index(i, j)].push((re, -SQRT_2));
            entries[svec_index(i + d, j + d)].push((re, -SQRT_2));
            entries[svec_index(i, j + d)].push((im, -SQRT_2));
            entries[svec_index(j, i + d)].push((im, SQRT_2));
        }
    }
    if let Some(t) = shift {
        for k in 0..n {
            entries[svec_index(k, k)].push((t, 1.0));
        }
    }
    for terms in entries {
        prog.row(terms, 0.0);
    }
    prog.cone(PSDTriangleConeT(n));
}

/// Push the second order cone bounding the weighted residual
/// `|| w . (means - rows x) || <= u`.
pub(crate) fn weighted_residual_soc(
    prog: &mut ConeProgram,
    rows: &[Vec<f64>],
    means: &[f64],
    weights: &[f64],
    u: usize,
) {
    prog.row([(u, -1.0)], 0.0);
    for ((coeffs, &m), &w) in rows.iter().zip(means).zip(weights) {
        prog.row(
            coeffs.iter().enumerate().map(|(j, &c)| (j, w * c)),
            w * m,
        );
    }
    prog.cone(SecondOrderConeT(rows.len() + 1));
}
