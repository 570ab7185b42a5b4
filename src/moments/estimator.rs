//! Noise-aware method-of-moments estimators
//!
//! Observed UMI counts are modeled as a sampling process applied to a latent
//! expression value. Under the Poisson model `E[X^2 - X] = sf^2 E[Y^2]`; under
//! the hypergeometric model the self-pairing term shrinks to `(1 - q) X`, where
//! `q` is the group capture rate. Inverting these relations with `1/sf` and
//! `1/sf^2` weights yields the debiased first and second moments of the latent
//! expression, from which mean, variance and covariance follow.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::data::CountMatrix;
use crate::error::{MementoError, Result};

/// Generative noise model for the observed counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoiseModel {
    /// Poisson sampling, counts normalized by per-cell size factors
    PoissonRelative,
    /// Poisson sampling, no library-size normalization
    PoissonAbsolute,
    /// Sampling without replacement at capture rate q, normalized by size factors
    HypergeometricRelative,
    /// Sampling without replacement at capture rate q, no normalization
    HypergeometricAbsolute,
}

impl NoiseModel {
    /// Whether counts are normalized by per-cell size factors
    pub fn is_relative(self) -> bool {
        matches!(self, NoiseModel::PoissonRelative | NoiseModel::HypergeometricRelative)
    }

    /// Whether the model needs a capture rate
    pub fn is_hypergeometric(self) -> bool {
        matches!(
            self,
            NoiseModel::HypergeometricRelative | NoiseModel::HypergeometricAbsolute
        )
    }

    /// Coefficient on the first moment in the second-moment noise correction
    pub fn sampling_correction(self, capture_rate: f64) -> f64 {
        if self.is_hypergeometric() {
            1.0 - capture_rate
        } else {
            1.0
        }
    }

    /// Canonical short name
    pub fn name(self) -> &'static str {
        match self {
            NoiseModel::PoissonRelative => "poi_relative",
            NoiseModel::PoissonAbsolute => "poi_absolute",
            NoiseModel::HypergeometricRelative => "hyper_relative",
            NoiseModel::HypergeometricAbsolute => "hyper_absolute",
        }
    }
}

impl Default for NoiseModel {
    fn default() -> Self {
        NoiseModel::HypergeometricRelative
    }
}

impl fmt::Display for NoiseModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NoiseModel {
    type Err = MementoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "poi_relative" | "poisson_relative" => Ok(NoiseModel::PoissonRelative),
            "poi_absolute" | "poisson_absolute" => Ok(NoiseModel::PoissonAbsolute),
            "hyper_relative" | "hypergeometric_relative" => Ok(NoiseModel::HypergeometricRelative),
            "hyper_absolute" | "hypergeometric_absolute" => Ok(NoiseModel::HypergeometricAbsolute),
            other => Err(MementoError::config(format!(
                "Unknown noise model '{}'. Use poi_relative, poi_absolute, hyper_relative or hyper_absolute.",
                other
            ))),
        }
    }
}

/// Debiased per-gene first and second central moments
#[derive(Debug, Clone, PartialEq)]
pub struct Moments1d {
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
}

/// Compressed support reweighted by bootstrap frequencies
///
/// `weights` has one row per support point and one column per replicate.
/// `n_obs` is the total weight of a column (1 for Dirichlet draws, the cell
/// count for multinomial draws).
#[derive(Debug, Clone, Copy)]
pub struct WeightedSupport<'a> {
    pub inv_sf: &'a [f64],
    pub inv_sf_sq: &'a [f64],
    pub weights: ArrayView2<'a, f64>,
    pub n_obs: f64,
}

/// Moment estimator bound to one noise model and one group capture rate
#[derive(Debug, Clone, Copy)]
pub struct MomentEstimator {
    model: NoiseModel,
    correction: f64,
}

impl MomentEstimator {
    pub fn new(model: NoiseModel, capture_rate: f64) -> Self {
        Self {
            model,
            correction: model.sampling_correction(capture_rate),
        }
    }

    pub fn model(&self) -> NoiseModel {
        self.model
    }

    /// Per-cell first-moment weight (1/sf for relative models, 1 otherwise)
    pub fn cell_weight(&self, size_factor: f64) -> f64 {
        if self.model.is_relative() {
            1.0 / size_factor
        } else {
            1.0
        }
    }

    /// Mean and variance of a single sparse gene column
    ///
    /// Genes with fewer than two distinct observed values carry no information
    /// about dispersion and yield NaN.
    pub fn estimate_gene(&self, rows: &[usize], values: &[f64], n_cells: usize, size_factor: &[f64]) -> (f64, f64) {
        if !has_two_distinct(values, n_cells) {
            return (f64::NAN, f64::NAN);
        }

        let n = n_cells as f64;
        let mut m1 = 0.0;
        let mut m2 = 0.0;
        for (&row, &x) in rows.iter().zip(values) {
            let w = self.cell_weight(size_factor[row]);
            m1 += x * w;
            m2 += (x * x - self.correction * x) * w * w;
        }
        let mean = m1 / n;
        (mean, m2 / n - mean * mean)
    }

    /// Moments for every gene of a group slice
    pub fn estimate_1d(&self, counts: &CountMatrix, size_factor: &[f64]) -> Moments1d {
        let n_cells = counts.n_cells();
        let (mean, variance): (Vec<f64>, Vec<f64>) = (0..counts.n_genes())
            .map(|j| {
                let (rows, values) = counts.gene_column(j);
                self.estimate_gene(rows, values, n_cells, size_factor)
            })
            .unzip();

        let n_negative = variance.iter().filter(|&&v| v < 0.0).count();
        if n_negative > 0 {
            log::debug!(
                "{} of {} genes have a negative {} variance estimate",
                n_negative,
                variance.len(),
                self.model
            );
        }

        Moments1d { mean, variance }
    }

    /// Covariance between two sparse gene columns
    ///
    /// When both columns are the same gene the self-pairing noise term is
    /// removed so the result equals that gene's variance estimate.
    pub fn estimate_pair(
        &self,
        col_a: (&[usize], &[f64]),
        col_b: (&[usize], &[f64]),
        same_gene: bool,
        n_cells: usize,
        size_factor: &[f64],
    ) -> f64 {
        if !has_two_distinct(col_a.1, n_cells) || !has_two_distinct(col_b.1, n_cells) {
            return f64::NAN;
        }

        let n = n_cells as f64;
        let first_moment = |(rows, values): (&[usize], &[f64])| -> f64 {
            rows.iter()
                .zip(values)
                .map(|(&row, &x)| x * self.cell_weight(size_factor[row]))
                .sum::<f64>()
                / n
        };
        let m1_a = first_moment(col_a);
        let m1_b = first_moment(col_b);

        // Sparse intersection over sorted row indices
        let (rows_a, values_a) = col_a;
        let (rows_b, values_b) = col_b;
        let mut cross = 0.0;
        let (mut i, mut j) = (0, 0);
        while i < rows_a.len() && j < rows_b.len() {
            match rows_a[i].cmp(&rows_b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    let w = self.cell_weight(size_factor[rows_a[i]]);
                    cross += values_a[i] * values_b[j] * w * w;
                    i += 1;
                    j += 1;
                }
            }
        }

        if same_gene {
            let self_pairing: f64 = rows_a
                .iter()
                .zip(values_a)
                .map(|(&row, &x)| {
                    let w = self.cell_weight(size_factor[row]);
                    x * w * w
                })
                .sum();
            cross -= self.correction * self_pairing;
        }

        cross / n - m1_a * m1_b
    }

    /// Covariances for a list of (gene, gene) index pairs
    pub fn estimate_cov(&self, counts: &CountMatrix, size_factor: &[f64], pairs: &[(usize, usize)]) -> Vec<f64> {
        let n_cells = counts.n_cells();
        pairs
            .iter()
            .map(|&(a, b)| {
                self.estimate_pair(
                    counts.gene_column(a),
                    counts.gene_column(b),
                    a == b,
                    n_cells,
                    size_factor,
                )
            })
            .collect()
    }

    /// Mean and variance for every replicate column of a compressed support
    pub fn estimate_1d_weighted(&self, values: &[f64], support: &WeightedSupport<'_>) -> (Array1<f64>, Array1<f64>) {
        let first: Array1<f64> = values
            .iter()
            .zip(support.inv_sf)
            .map(|(&x, &w)| x * w)
            .collect();
        let second: Array1<f64> = values
            .iter()
            .zip(support.inv_sf_sq)
            .map(|(&x, &w2)| (x * x - self.correction * x) * w2)
            .collect();

        let mean = first.dot(&support.weights) / support.n_obs;
        let m2 = second.dot(&support.weights) / support.n_obs;
        let variance = &m2 - &mean.mapv(|m| m * m);
        (mean, variance)
    }

    /// Covariance between two distinct genes for every replicate column
    pub fn estimate_cov_weighted(&self, values_a: &[f64], values_b: &[f64], support: &WeightedSupport<'_>) -> Array1<f64> {
        let first_a: Array1<f64> = values_a.iter().zip(support.inv_sf).map(|(&x, &w)| x * w).collect();
        let first_b: Array1<f64> = values_b.iter().zip(support.inv_sf).map(|(&x, &w)| x * w).collect();
        let cross: Array1<f64> = values_a
            .iter()
            .zip(values_b)
            .zip(support.inv_sf_sq)
            .map(|((&a, &b), &w2)| a * b * w2)
            .collect();

        let m1_a = first_a.dot(&support.weights) / support.n_obs;
        let m1_b = first_b.dot(&support.weights) / support.n_obs;
        let mx = cross.dot(&support.weights) / support.n_obs;
        mx - &m1_a * &m1_b
    }
}

/// True when a sparse column (zeros implicit) takes at least two distinct values
fn has_two_distinct(values: &[f64], n_cells: usize) -> bool {
    if values.len() < n_cells {
        return !values.is_empty();
    }
    values.iter().any(|&v| v != values[0])
}

/// Convert a covariance into a correlation
///
/// Non-positive variances and results outside [-1, 1] are numerically
/// impossible and are reported as NaN.
pub fn corr_from_cov(cov: f64, var_1: f64, var_2: f64) -> f64 {
    if !(var_1 > 0.0 && var_2 > 0.0) || !cov.is_finite() {
        return f64::NAN;
    }
    let corr = cov / (var_1 * var_2).sqrt();
    if (-1.0..=1.0).contains(&corr) {
        corr
    } else {
        f64::NAN
    }
}
