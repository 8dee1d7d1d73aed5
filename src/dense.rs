//! Dense LU solver with partial pivoting
//!
//! Direct solver for the level linear systems in the test fixtures and small
//! hierarchies. The mixed-form saddle matrices carry a zero
//! potential-potential block, so row pivoting is mandatory, not a refinement.

use ndarray::{Array1, Array2};
use thiserror::Error;

/// Errors that can occur during LU factorization
#[derive(Error, Debug)]
pub enum LuError {
    #[error("matrix is singular or nearly singular")]
    SingularMatrix,
    #[error("matrix dimensions mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// LU factorization result
///
/// Stores the combined factors along with the row-swap sequence.
#[derive(Debug, Clone)]
pub struct LuFactorization {
    /// Combined L and U matrices (L is unit lower triangular, stored below
    /// the diagonal)
    pub lu: Array2<f64>,
    /// Row swapped with row `k` at elimination step `k`; applied in order
    pub pivots: Vec<usize>,
    /// Matrix dimension
    pub n: usize,
}

impl LuFactorization {
    /// Solve `Ax = b` using the pre-computed factorization
    pub fn solve(&self, b: &Array1<f64>) -> Result<Array1<f64>, LuError> {
        if b.len() != self.n {
            return Err(LuError::DimensionMismatch {
                expected: self.n,
                got: b.len(),
            });
        }

        let mut x = b.clone();

        // replay the row swaps in elimination order
        for i in 0..self.n {
            let pivot = self.pivots[i];
            if pivot != i {
                x.swap(i, pivot);
            }
        }

        // forward substitution: Ly = Pb
        for i in 0..self.n {
            for j in 0..i {
                let l_ij = self.lu[[i, j]];
                x[i] -= l_ij * x[j];
            }
        }

        // backward substitution: Ux = y
        for i in (0..self.n).rev() {
            for j in (i + 1)..self.n {
                let u_ij = self.lu[[i, j]];
                x[i] -= u_ij * x[j];
            }
            let u_ii = self.lu[[i, i]];
            if u_ii.abs() < 1e-30 {
                return Err(LuError::SingularMatrix);
            }
            x[i] /= u_ii;
        }

        Ok(x)
    }
}

/// Compute an LU factorization with partial pivoting
pub fn lu_factorize(a: &Array2<f64>) -> Result<LuFactorization, LuError> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(LuError::DimensionMismatch {
            expected: n,
            got: a.ncols(),
        });
    }

    let mut lu = a.clone();
    let mut pivots: Vec<usize> = (0..n).collect();

    for k in 0..n {
        let mut max_val = lu[[k, k]].abs();
        let mut max_row = k;
        for i in (k + 1)..n {
            let val = lu[[i, k]].abs();
            if val > max_val {
                max_val = val;
                max_row = i;
            }
        }

        if max_val < 1e-30 {
            return Err(LuError::SingularMatrix);
        }

        if max_row != k {
            for j in 0..n {
                let tmp = lu[[k, j]];
                lu[[k, j]] = lu[[max_row, j]];
                lu[[max_row, j]] = tmp;
            }
        }
        pivots[k] = max_row;

        let pivot = lu[[k, k]];
        for i in (k + 1)..n {
            let mult = lu[[i, k]] / pivot;
            lu[[i, k]] = mult;
            for j in (k + 1)..n {
                let update = mult * lu[[k, j]];
                lu[[i, j]] -= update;
            }
        }
    }

    Ok(LuFactorization { lu, pivots, n })
}

/// Solve `Ax = b`, combining factorization and solve
pub fn lu_solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, LuError> {
    let factorization = lu_factorize(a)?;
    factorization.solve(b)
}
