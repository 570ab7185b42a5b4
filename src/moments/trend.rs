//! Mean-variance trend fitting and residual variance

use serde::{Deserialize, Serialize};

use crate::error::{MementoError, Result};

/// Log-log linear fit `log(variance) = slope * log(mean) + intercept`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendFit {
    pub slope: f64,
    pub intercept: f64,
}

impl TrendFit {
    /// Ordinary least squares over genes with strictly positive, finite mean and variance
    pub fn fit(mean: &[f64], variance: &[f64]) -> Result<Self> {
        let points: Vec<(f64, f64)> = mean
            .iter()
            .zip(variance)
            .filter(|(&m, &v)| m > 0.0 && v > 0.0 && m.is_finite() && v.is_finite())
            .map(|(&m, &v)| (m.ln(), v.ln()))
            .collect();

        if points.len() < 2 {
            return Err(MementoError::TrendFittingFailed {
                reason: format!("{} genes with positive mean and variance", points.len()),
            });
        }

        let n = points.len() as f64;
        let x_bar = points.iter().map(|p| p.0).sum::<f64>() / n;
        let y_bar = points.iter().map(|p| p.1).sum::<f64>() / n;
        let sxx: f64 = points.iter().map(|p| (p.0 - x_bar).powi(2)).sum();
        let sxy: f64 = points.iter().map(|p| (p.0 - x_bar) * (p.1 - y_bar)).sum();

        if sxx <= 1e-12 * n {
            return Err(MementoError::TrendFittingFailed {
                reason: "log means are all identical".to_string(),
            });
        }

        let slope = sxy / sxx;
        Ok(Self {
            slope,
            intercept: y_bar - slope * x_bar,
        })
    }

    /// Expected variance at a given mean
    pub fn expected_variance(&self, mean: f64) -> f64 {
        self.intercept.exp() * mean.powf(self.slope)
    }

    /// Residual variance for one gene; NaN unless mean and variance are positive
    pub fn residual_variance(&self, mean: f64, variance: f64) -> f64 {
        if mean > 0.0 && variance > 0.0 {
            variance / self.expected_variance(mean)
        } else {
            f64::NAN
        }
    }

    pub fn residual_variances(&self, mean: &[f64], variance: &[f64]) -> Vec<f64> {
        mean.iter()
            .zip(variance)
            .map(|(&m, &v)| self.residual_variance(m, v))
            .collect()
    }
}

/// Fit a group trend, falling back to `fallback` when the group fit fails
pub fn fit_with_fallback(group: &str, mean: &[f64], variance: &[f64], fallback: Option<TrendFit>) -> Option<TrendFit> {
    match TrendFit::fit(mean, variance) {
        Ok(fit) => Some(fit),
        Err(e) => match fallback {
            Some(global) => {
                log::warn!("Trend fit for group {} failed ({}), using the all-cell trend", group, e);
                Some(global)
            }
            None => {
                log::warn!(
                    "Trend fit for group {} failed ({}) and no all-cell trend is available; residual variances are NaN",
                    group,
                    e
                );
                None
            }
        },
    }
}
