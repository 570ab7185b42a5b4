//! Weighted least squares shared across many response columns

use ndarray::{Array1, Array2, ArrayView2};

use crate::error::{MementoError, Result};

/// Relative pivot tolerance for the Cholesky factorization
const PIVOT_TOL: f64 = 1e-10;

/// Cholesky factor of a symmetric positive definite n x n matrix (row-major, lower)
///
/// Fails instead of regularizing when a pivot collapses, so rank deficient
/// designs surface as errors.
fn cholesky(a: &[f64], n: usize) -> Result<Vec<f64>> {
    let scale = (0..n).map(|i| a[i * n + i].abs()).fold(0.0, f64::max);
    let mut l = vec![0.0; n * n];

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if !(sum > PIVOT_TOL * scale) {
                    return Err(MementoError::SingularDesign {
                        reason: format!("pivot {} collapsed to {:e}", i, sum),
                    });
                }
                l[i * n + j] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    Ok(l)
}

/// Solve L L^T x = b given the Cholesky factor L
fn cholesky_solve(l: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i * n + j] * y[j];
        }
        y[i] = sum / l[i * n + i];
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= l[j * n + i] * x[j];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

/// Factorized weighted normal equations `X^T W X beta = X^T W y`
#[derive(Debug, Clone)]
pub struct WeightedLeastSquares {
    /// X^T W (coefficients x observations)
    xtw: Array2<f64>,
    /// Cholesky factor of X^T W X
    factor: Vec<f64>,
    n_coefs: usize,
}

impl WeightedLeastSquares {
    pub fn new(design: ArrayView2<'_, f64>, weights: &[f64]) -> Result<Self> {
        let (n_obs, n_coefs) = design.dim();
        if weights.len() != n_obs {
            return Err(MementoError::DimensionMismatch {
                expected: format!("{} weights", n_obs),
                got: format!("{} weights", weights.len()),
            });
        }
        if n_obs < n_coefs {
            return Err(MementoError::SingularDesign {
                reason: format!("{} observations for {} coefficients", n_obs, n_coefs),
            });
        }

        let mut xtw = design.t().to_owned();
        for (mut column, &w) in xtw.columns_mut().into_iter().zip(weights) {
            column *= w;
        }
        let xtwx = xtw.dot(&design);
        let flat: Vec<f64> = xtwx.iter().copied().collect();
        let factor = cholesky(&flat, n_coefs)?;

        Ok(Self { xtw, factor, n_coefs })
    }

    /// Linear functional mapping a response column to coefficient `index`
    pub fn coefficient_operator(&self, index: usize) -> Array1<f64> {
        let mut unit = vec![0.0; self.n_coefs];
        unit[index] = 1.0;
        // Row `index` of (X^T W X)^-1 by symmetry
        let row = Array1::from(cholesky_solve(&self.factor, &unit, self.n_coefs));
        row.dot(&self.xtw)
    }

    /// Coefficient `index` for every response column of `y` (observations x columns)
    pub fn coefficient(&self, index: usize, y: ArrayView2<'_, f64>) -> Array1<f64> {
        self.coefficient_operator(index).dot(&y)
    }

    /// All coefficients for every response column (coefficients x columns)
    pub fn solve(&self, y: ArrayView2<'_, f64>) -> Array2<f64> {
        let rhs = self.xtw.dot(&y);
        let mut beta = Array2::zeros(rhs.dim());
        for (k, column) in rhs.columns().into_iter().enumerate() {
            let b: Vec<f64> = column.iter().copied().collect();
            let x = cholesky_solve(&self.factor, &b, self.n_coefs);
            for (i, v) in x.into_iter().enumerate() {
                beta[[i, k]] = v;
            }
        }
        beta
    }
}
