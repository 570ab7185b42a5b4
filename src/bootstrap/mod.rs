//! Compressed bootstrap of per-group moments
//!
//! For one gene (or gene pair) in one group: compress the column(s), draw
//! `num_boot` replicate weight vectors over the compressed support, re-estimate
//! the moments under each replicate and shift the replicates so their mean
//! matches the full-data estimate. Slot 0 of every sample holds the
//! full-data value.

mod compress;

pub use compress::{compress, distinct_values, CompressedSupport, SparseColumn};

use ndarray::Array2;
use rand::Rng;

use crate::data::GroupSlice;
use crate::error::Result;
use crate::moments::{corr_from_cov, MomentEstimator, NoiseModel, TrendFit};
use crate::normalization::{bin_size_factors, BinStatistic};
use crate::rng::{dirichlet_draws, multinomial_draws};
use crate::stats::nan_mean;

/// Upper bound on size factor bins when the bin count follows the data
const MAX_SF_BINS: usize = 20;

/// Parameters for bootstrap resampling
#[derive(Debug, Clone)]
pub struct BootstrapParams {
    /// Number of resampled replicates
    pub num_boot: usize,
    /// Use Dirichlet draws instead of exact multinomial draws
    pub dirichlet_approx: bool,
    /// Fixed number of size factor bins; default is min(distinct values, 20)
    pub sf_bins: Option<usize>,
}

impl Default for BootstrapParams {
    fn default() -> Self {
        Self {
            num_boot: 5000,
            dirichlet_approx: true,
            sf_bins: None,
        }
    }
}

/// A statistic's full-data value (slot 0) followed by its replicates
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapSample {
    pub values: Vec<f64>,
}

impl BootstrapSample {
    pub fn nan(num_boot: usize) -> Self {
        Self {
            values: vec![f64::NAN; num_boot + 1],
        }
    }

    /// Build from a full-data value and replicate estimates
    pub fn from_replicates(true_value: f64, replicates: impl IntoIterator<Item = f64>) -> Self {
        let values = std::iter::once(true_value).chain(replicates).collect();
        Self { values }
    }

    pub fn true_value(&self) -> f64 {
        self.values[0]
    }

    pub fn replicates(&self) -> &[f64] {
        &self.values[1..]
    }

    /// Fraction of replicates that are not finite
    pub fn nan_fraction(&self) -> f64 {
        let reps = self.replicates();
        if reps.is_empty() {
            return 0.0;
        }
        reps.iter().filter(|v| !v.is_finite()).count() as f64 / reps.len() as f64
    }

    pub fn num_boot(&self) -> usize {
        self.values.len() - 1
    }
}

/// Bootstrap distributions of the 1D test statistics for one gene in one group
#[derive(Debug, Clone, PartialEq)]
pub struct Bootstrap1d {
    pub log_mean: BootstrapSample,
    pub log_residual_variance: BootstrapSample,
}

/// Bootstrap distribution of the correlation for one gene pair in one group
#[derive(Debug, Clone, PartialEq)]
pub struct Bootstrap2d {
    pub corr: BootstrapSample,
    /// Fraction of raw correlation replicates that were not finite
    pub nan_fraction: f64,
}

/// Shift finite replicates so that their mean equals `true_value`
///
/// With slot 0 holding `true_value`, the mean over the whole sample then
/// equals `true_value` too.
pub fn bias_correct(replicates: &mut [f64], true_value: f64) {
    let center = nan_mean(replicates);
    if !center.is_finite() || !true_value.is_finite() {
        return;
    }
    let shift = true_value - center;
    for r in replicates.iter_mut() {
        *r += shift;
    }
}

fn log_positive(x: f64) -> f64 {
    if x > 0.0 {
        x.ln()
    } else {
        f64::NAN
    }
}

/// Full-data 1D moments of one gene in one group
#[derive(Debug, Clone, Copy)]
pub struct TrueMoments {
    pub mean: f64,
    pub variance: f64,
}

/// Replicate weights and their column total for a compressed support
fn draw_weights<R: Rng + ?Sized>(
    rng: &mut R,
    support: &CompressedSupport,
    params: &BootstrapParams,
) -> Result<(Array2<f64>, f64)> {
    if params.dirichlet_approx {
        Ok((dirichlet_draws(rng, &support.counts, params.num_boot)?, 1.0))
    } else {
        Ok((
            multinomial_draws(rng, &support.counts, params.num_boot)?,
            support.n_cells as f64,
        ))
    }
}

fn sf_bin_count(params: &BootstrapParams, distinct: usize) -> usize {
    params.sf_bins.unwrap_or_else(|| distinct.min(MAX_SF_BINS)).max(1)
}

/// Bootstrap log mean and log residual variance of one gene in one group
///
/// Genes with fewer than two distinct values yield all-NaN samples.
pub fn bootstrap_1d<R: Rng + ?Sized>(
    rng: &mut R,
    slice: &GroupSlice<'_>,
    gene: usize,
    truth: TrueMoments,
    trend: Option<TrendFit>,
    model: NoiseModel,
    params: &BootstrapParams,
) -> Result<Bootstrap1d> {
    let nan = || Bootstrap1d {
        log_mean: BootstrapSample::nan(params.num_boot),
        log_residual_variance: BootstrapSample::nan(params.num_boot),
    };

    let column = slice.counts.gene_column(gene);
    let distinct = distinct_values(column, slice.cell_count);
    let bins = bin_size_factors(
        slice.approx_size_factor,
        sf_bin_count(params, distinct),
        BinStatistic::Median,
    );
    let estimator = MomentEstimator::new(model, slice.capture_rate);

    let Some(support) = compress(column, None, &bins, &estimator) else {
        return Ok(nan());
    };

    let (weights, n_obs) = draw_weights(rng, &support, params)?;
    let (mean, variance) = estimator.estimate_1d_weighted(&support.values_1, &support.weighted(weights.view(), n_obs));

    let mut mean = mean.to_vec();
    let mut variance = variance.to_vec();
    bias_correct(&mut mean, truth.mean);
    bias_correct(&mut variance, truth.variance);

    let residual = |m: f64, v: f64| trend.map_or(f64::NAN, |t| t.residual_variance(m, v));

    Ok(Bootstrap1d {
        log_mean: BootstrapSample::from_replicates(log_positive(truth.mean), mean.iter().map(|&m| log_positive(m))),
        log_residual_variance: BootstrapSample::from_replicates(
            log_positive(residual(truth.mean, truth.variance)),
            mean.iter().zip(&variance).map(|(&m, &v)| log_positive(residual(m, v))),
        ),
    })
}

/// Full-data moments of a gene pair in one group
#[derive(Debug, Clone, Copy)]
pub struct TruePairMoments {
    pub variance_1: f64,
    pub variance_2: f64,
    pub corr: f64,
}

/// Bootstrap the correlation of one gene pair in one group
pub fn bootstrap_2d<R: Rng + ?Sized>(
    rng: &mut R,
    slice: &GroupSlice<'_>,
    pair: (usize, usize),
    truth: TruePairMoments,
    model: NoiseModel,
    params: &BootstrapParams,
) -> Result<Bootstrap2d> {
    let col_1 = slice.counts.gene_column(pair.0);
    let col_2 = slice.counts.gene_column(pair.1);
    let distinct = distinct_values(col_1, slice.cell_count).max(distinct_values(col_2, slice.cell_count));
    let bins = bin_size_factors(
        slice.approx_size_factor,
        sf_bin_count(params, distinct),
        BinStatistic::Median,
    );
    let estimator = MomentEstimator::new(model, slice.capture_rate);

    let Some(support) = compress(col_1, Some(col_2), &bins, &estimator) else {
        return Ok(Bootstrap2d {
            corr: BootstrapSample::nan(params.num_boot),
            nan_fraction: 1.0,
        });
    };

    let (weights, n_obs) = draw_weights(rng, &support, params)?;
    let weighted = support.weighted(weights.view(), n_obs);
    let (_, var_1) = estimator.estimate_1d_weighted(&support.values_1, &weighted);
    let (_, var_2) = estimator.estimate_1d_weighted(&support.values_2, &weighted);
    let cov = estimator.estimate_cov_weighted(&support.values_1, &support.values_2, &weighted);

    let mut var_1 = var_1.to_vec();
    let mut var_2 = var_2.to_vec();
    bias_correct(&mut var_1, truth.variance_1);
    bias_correct(&mut var_2, truth.variance_2);

    let mut corr: Vec<f64> = cov
        .iter()
        .zip(var_1.iter().zip(&var_2))
        .map(|(&c, (&v1, &v2))| corr_from_cov(c, v1, v2))
        .collect();
    bias_correct(&mut corr, truth.corr);

    let corr = BootstrapSample::from_replicates(truth.corr, corr);
    let nan_fraction = corr.nan_fraction();
    Ok(Bootstrap2d { corr, nan_fraction })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CountMatrix;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};

    fn poisson_matrix(lambdas: &[f64], n_cells: usize, seed: u64) -> CountMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let dense = Array2::from_shape_fn((n_cells, lambdas.len()), |(_, j)| {
            Poisson::new(lambdas[j]).unwrap().sample(&mut rng)
        });
        CountMatrix::from_dense(
            dense.view(),
            (0..lambdas.len()).map(|j| format!("g{}", j)).collect(),
            (0..n_cells).map(|i| format!("c{}", i)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_bias_correction_restores_true_mean() {
        let mut reps = vec![1.0, 2.0, f64::NAN, 6.0];
        bias_correct(&mut reps, 10.0);
        assert!((nan_mean(&reps) - 10.0).abs() < 1e-12);

        let sample = BootstrapSample::from_replicates(10.0, reps);
        assert_eq!(sample.true_value(), 10.0);
        assert!((sample.nan_fraction() - 0.25).abs() < 1e-12);
        assert!((nan_mean(&sample.values) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_bootstrap_1d_centers_on_truth() {
        let counts = poisson_matrix(&[5.0], 300, 1);
        let sf = vec![1.0; 300];
        let slice = GroupSlice {
            counts: &counts,
            size_factor: &sf,
            approx_size_factor: &sf,
            capture_rate: 0.0,
            cell_count: 300,
        };
        let model = NoiseModel::PoissonAbsolute;
        let (rows, values) = counts.gene_column(0);
        let (mean, variance) = MomentEstimator::new(model, 0.0).estimate_gene(rows, values, 300, &sf);
        let trend = Some(TrendFit { slope: 1.0, intercept: 0.0 });
        let params = BootstrapParams {
            num_boot: 200,
            ..BootstrapParams::default()
        };

        let mut rng = StdRng::seed_from_u64(3);
        let boot = bootstrap_1d(&mut rng, &slice, 0, TrueMoments { mean, variance }, trend, model, &params).unwrap();
        assert_eq!(boot.log_mean.values.len(), 201);
        assert!((boot.log_mean.true_value() - mean.ln()).abs() < 1e-12);

        // Replicate log means scatter narrowly around the truth
        let reps = boot.log_mean.replicates();
        assert!(reps.iter().all(|r| r.is_finite()));
        let spread = reps.iter().map(|r| (r - mean.ln()).abs()).fold(0.0, f64::max);
        assert!(spread < 0.2);
    }

    #[test]
    fn test_bootstrap_constant_gene_is_nan() {
        let dense = Array2::from_elem((10, 1), 3.0);
        let counts = CountMatrix::from_dense(
            dense.view(),
            vec!["g".into()],
            (0..10).map(|i| format!("c{}", i)).collect(),
        )
        .unwrap();
        let sf = vec![1.0; 10];
        let slice = GroupSlice {
            counts: &counts,
            size_factor: &sf,
            approx_size_factor: &sf,
            capture_rate: 0.0,
            cell_count: 10,
        };
        let params = BootstrapParams {
            num_boot: 10,
            ..BootstrapParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let truth = TrueMoments { mean: f64::NAN, variance: f64::NAN };
        let boot = bootstrap_1d(&mut rng, &slice, 0, truth, None, NoiseModel::PoissonAbsolute, &params).unwrap();
        assert!(boot.log_mean.values.iter().all(|v| v.is_nan()));
        assert_eq!(boot.log_mean.values.len(), 11);
    }

    #[test]
    fn test_bootstrap_2d_multinomial() {
        let counts = poisson_matrix(&[4.0, 6.0], 200, 7);
        let sf = vec![1.0; 200];
        let slice = GroupSlice {
            counts: &counts,
            size_factor: &sf,
            approx_size_factor: &sf,
            capture_rate: 0.0,
            cell_count: 200,
        };
        let model = NoiseModel::PoissonAbsolute;
        let est = MomentEstimator::new(model, 0.0);
        let m = est.estimate_1d(&counts, &sf);
        let cov = est.estimate_cov(&counts, &sf, &[(0, 1)])[0];
        let truth = TruePairMoments {
            variance_1: m.variance[0],
            variance_2: m.variance[1],
            corr: corr_from_cov(cov, m.variance[0], m.variance[1]),
        };
        let params = BootstrapParams {
            num_boot: 100,
            dirichlet_approx: false,
            sf_bins: None,
        };
        let mut rng = StdRng::seed_from_u64(4);
        let boot = bootstrap_2d(&mut rng, &slice, (0, 1), truth, model, &params).unwrap();
        assert_eq!(boot.corr.values.len(), 101);
        assert_eq!(boot.corr.true_value(), truth.corr);
        let non_finite = boot.corr.replicates().iter().filter(|c| !c.is_finite()).count();
        assert_eq!(boot.nan_fraction, non_finite as f64 / 100.0);
        if truth.corr.is_finite() {
            assert!((nan_mean(boot.corr.replicates()) - truth.corr).abs() < 1e-9);
        }
    }
}
