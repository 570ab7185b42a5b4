//! Per-cell size factor estimation and size factor binning

use rayon::prelude::*;

use crate::data::{CountMatrix, GroupStore};
use crate::error::Result;
use crate::moments::{MomentEstimator, NoiseModel, TrendFit};
use crate::stats::quantile_type7;

/// Genes below this observed mean are excluded from the stable-gene selection
const MIN_MEAN_FOR_TRIM: f64 = 0.1;

/// Parameters for the trimmed/shrunk size factor
#[derive(Debug, Clone)]
pub struct SizeFactorParams {
    /// Quantile of residual variance below which genes count as stable
    pub trim_percent: f64,
    /// Weight on the naive factor in the final combination
    pub shrinkage: f64,
}

impl Default for SizeFactorParams {
    fn default() -> Self {
        Self {
            trim_percent: 0.1,
            shrinkage: 0.5,
        }
    }
}

/// Summary statistic assigned to every cell of a size factor bin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinStatistic {
    Mean,
    Median,
}

/// Equal-width histogram of size factors
#[derive(Debug, Clone, PartialEq)]
pub struct SizeFactorBins {
    /// Bin index of every cell
    pub assignment: Vec<usize>,
    /// Representative size factor of every bin (NaN for empty bins)
    pub values: Vec<f64>,
}

impl SizeFactorBins {
    /// Representative size factor per cell
    pub fn per_cell(&self) -> Vec<f64> {
        self.assignment.iter().map(|&b| self.values[b]).collect()
    }
}

/// Total counts per cell
pub fn naive_size_factor(counts: &CountMatrix) -> Vec<f64> {
    counts.cell_totals(None)
}

/// Estimate a per-cell size factor
///
/// Absolute models use 1 for every cell. Relative models start from per-cell
/// totals and shrink them toward totals over the most stable genes, i.e. those
/// whose residual variance falls in the lowest `trim_percent` quantile.
/// Deterministic for a given matrix and parameter set.
pub fn estimate_size_factor(
    counts: &CountMatrix,
    model: NoiseModel,
    capture_rate: f64,
    params: &SizeFactorParams,
) -> Vec<f64> {
    if !model.is_relative() {
        return vec![1.0; counts.n_cells()];
    }

    let naive = floor_non_positive(naive_size_factor(counts));
    if params.shrinkage >= 1.0 {
        return naive;
    }

    let Some(stable_mask) = stable_genes(counts, &naive, model, capture_rate, params.trim_percent) else {
        return naive;
    };

    let stable_totals = counts.cell_totals(Some(&stable_mask));
    let naive_mean = naive.iter().sum::<f64>() / naive.len() as f64;
    let stable_mean = stable_totals.iter().sum::<f64>() / stable_totals.len() as f64;
    if stable_mean <= 0.0 {
        log::warn!("Stable genes carry no counts; keeping the naive size factor");
        return naive;
    }

    let combined: Vec<f64> = naive
        .iter()
        .zip(&stable_totals)
        .map(|(&n, &s)| params.shrinkage * n + (1.0 - params.shrinkage) * s * naive_mean / stable_mean)
        .collect();
    floor_non_positive(combined)
}

/// Estimate all-cell size factors and distribute them (exact and binned) to every group
pub fn compute_size_factors(store: &mut GroupStore, params: &SizeFactorParams, num_bins: usize) -> Result<()> {
    let size_factor = estimate_size_factor(store.counts(), store.noise_model(), store.capture_rate(), params);
    log::info!(
        "Estimated {} size factors for {} cells",
        store.noise_model(),
        size_factor.len()
    );
    store.set_size_factors(size_factor, num_bins)
}

/// Mask of genes with residual variance strictly below the trim quantile
fn stable_genes(
    counts: &CountMatrix,
    naive: &[f64],
    model: NoiseModel,
    capture_rate: f64,
    trim_percent: f64,
) -> Option<Vec<bool>> {
    let estimator = MomentEstimator::new(model, capture_rate);
    let n_cells = counts.n_cells();
    let observed = counts.gene_means();

    let (mean, variance): (Vec<f64>, Vec<f64>) = (0..counts.n_genes())
        .into_par_iter()
        .map(|j| {
            let (rows, values) = counts.gene_column(j);
            let (m, v) = estimator.estimate_gene(rows, values, n_cells, naive);
            if observed[j] < MIN_MEAN_FOR_TRIM {
                (0.0, v)
            } else {
                (m, v)
            }
        })
        .unzip();

    let trend = match TrendFit::fit(&mean, &variance) {
        Ok(trend) => trend,
        Err(e) => {
            log::warn!("Size factor trend fit failed ({}); keeping the naive size factor", e);
            return None;
        }
    };

    // Non-finite residual variances rank as infinitely unstable
    let residual: Vec<f64> = trend
        .residual_variances(&mean, &variance)
        .into_iter()
        .map(|r| if r.is_finite() { r } else { f64::INFINITY })
        .collect();

    let mut finite: Vec<f64> = residual.iter().copied().filter(|r| r.is_finite()).collect();
    finite.sort_by(|a, b| a.total_cmp(b));
    let threshold = quantile_type7(&finite, trim_percent);

    let mask: Vec<bool> = residual.iter().map(|&r| r < threshold).collect();
    let n_stable = mask.iter().filter(|&&s| s).count();
    if n_stable == 0 {
        log::warn!("No stable genes below the {} residual variance quantile; keeping the naive size factor", trim_percent);
        return None;
    }
    log::debug!("{} stable genes used for the trimmed size factor", n_stable);
    Some(mask)
}

/// Replace non-positive factors with the smallest positive factor
fn floor_non_positive(mut size_factor: Vec<f64>) -> Vec<f64> {
    let min_positive = size_factor
        .iter()
        .copied()
        .filter(|&s| s > 0.0 && s.is_finite())
        .fold(f64::INFINITY, f64::min);

    if !min_positive.is_finite() {
        log::warn!("No cell has a positive size factor; using 1 for every cell");
        return vec![1.0; size_factor.len()];
    }

    let n_floored = size_factor.iter().filter(|&&s| !(s > 0.0)).count();
    if n_floored > 0 {
        log::warn!(
            "{} cells have a non-positive size factor; setting them to {}",
            n_floored,
            min_positive
        );
        for s in size_factor.iter_mut().filter(|s| !(**s > 0.0)) {
            *s = min_positive;
        }
    }
    size_factor
}

/// Bin size factors into `num_bins` equal-width bins over their range
pub fn bin_size_factors(size_factor: &[f64], num_bins: usize, statistic: BinStatistic) -> SizeFactorBins {
    let num_bins = num_bins.max(1);
    let (lo, hi) = size_factor
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| (lo.min(s), hi.max(s)));
    let width = (hi - lo) / num_bins as f64;

    let assignment: Vec<usize> = size_factor
        .iter()
        .map(|&s| {
            if width > 0.0 {
                (((s - lo) / width).floor() as usize).min(num_bins - 1)
            } else {
                0
            }
        })
        .collect();

    let mut members: Vec<Vec<f64>> = vec![Vec::new(); num_bins];
    for (&b, &s) in assignment.iter().zip(size_factor) {
        members[b].push(s);
    }

    let values = members
        .into_iter()
        .map(|mut m| {
            if m.is_empty() {
                return f64::NAN;
            }
            match statistic {
                BinStatistic::Mean => m.iter().sum::<f64>() / m.len() as f64,
                BinStatistic::Median => {
                    m.sort_by(|a, b| a.total_cmp(b));
                    let k = m.len();
                    if k % 2 == 0 {
                        (m[k / 2 - 1] + m[k / 2]) / 2.0
                    } else {
                        m[k / 2]
                    }
                }
            }
        })
        .collect();

    SizeFactorBins { assignment, values }
}

/// Per-cell bin-mean size factors; cells at the maximum keep their exact value
pub fn approximate_size_factors(size_factor: &[f64], num_bins: usize) -> Vec<f64> {
    let mut approx = bin_size_factors(size_factor, num_bins, BinStatistic::Mean).per_cell();
    let max_sf = size_factor.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    for (a, &s) in approx.iter_mut().zip(size_factor) {
        if s == max_sf {
            *a = max_sf;
        }
    }
    approx
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};

    fn synthetic(n_cells: usize, n_genes: usize, seed: u64) -> CountMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let depth: Vec<f64> = (0..n_cells).map(|i| 0.5 + (i % 7) as f64 * 0.25).collect();
        let dense = Array2::from_shape_fn((n_cells, n_genes), |(i, j)| {
            let lambda = depth[i] * (0.2 + j as f64 * 0.3);
            Poisson::new(lambda).unwrap().sample(&mut rng)
        });
        CountMatrix::from_dense(
            dense.view(),
            (0..n_genes).map(|j| format!("g{}", j)).collect(),
            (0..n_cells).map(|i| format!("c{}", i)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_absolute_model_is_unit() {
        let counts = synthetic(20, 5, 1);
        let sf = estimate_size_factor(&counts, NoiseModel::PoissonAbsolute, 0.0, &SizeFactorParams::default());
        assert!(sf.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_full_shrinkage_returns_totals() {
        let counts = synthetic(30, 8, 2);
        let params = SizeFactorParams { trim_percent: 0.1, shrinkage: 1.0 };
        let sf = estimate_size_factor(&counts, NoiseModel::PoissonRelative, 0.0, &params);
        let totals = naive_size_factor(&counts);
        for (s, t) in sf.iter().zip(&totals) {
            if *t > 0.0 {
                assert_eq!(s, t);
            }
        }
    }

    #[test]
    fn test_trimmed_factor_is_deterministic_and_positive() {
        let counts = synthetic(200, 40, 3);
        let params = SizeFactorParams::default();
        let a = estimate_size_factor(&counts, NoiseModel::HypergeometricRelative, 0.1, &params);
        let b = estimate_size_factor(&counts, NoiseModel::HypergeometricRelative, 0.1, &params);
        assert_eq!(a, b);
        assert!(a.iter().all(|&s| s > 0.0 && s.is_finite()));
    }

    #[test]
    fn test_sparse_genes_fall_back_to_naive_factor() {
        // Every gene below the trim mean, then a single gene above it:
        // no trend can be fitted and the naive factor is returned
        let n_cells = 40;
        let sparse = Array2::from_shape_fn((n_cells, 5), |(i, j)| if (i + j) % 20 == 0 { 1.0 } else { 0.0 });
        let mut one_expressed = sparse.clone();
        for i in 0..n_cells {
            one_expressed[[i, 0]] = (3 + i % 4) as f64;
        }

        for dense in [sparse, one_expressed] {
            let counts = CountMatrix::from_dense(
                dense.view(),
                (0..5).map(|j| format!("g{}", j)).collect(),
                (0..n_cells).map(|i| format!("c{}", i)).collect(),
            )
            .unwrap();
            let expected = floor_non_positive(naive_size_factor(&counts));
            for model in [NoiseModel::PoissonRelative, NoiseModel::HypergeometricRelative] {
                let sf = estimate_size_factor(&counts, model, 0.1, &SizeFactorParams::default());
                assert_eq!(sf, expected);
            }
        }
    }

    #[test]
    fn test_non_positive_factors_are_floored() {
        let floored = floor_non_positive(vec![0.0, 2.0, 5.0, 0.0]);
        assert_eq!(floored, vec![2.0, 2.0, 5.0, 2.0]);
        assert_eq!(floor_non_positive(vec![0.0, 0.0]), vec![1.0, 1.0]);
    }

    #[test]
    fn test_binning() {
        let sf = vec![1.0, 1.1, 2.0, 2.9, 3.0, 10.0];
        let bins = bin_size_factors(&sf, 3, BinStatistic::Mean);
        assert_eq!(bins.assignment, vec![0, 0, 0, 0, 0, 2]);
        assert!((bins.values[0] - 2.0).abs() < 1e-12);
        assert!(bins.values[1].is_nan());

        let median = bin_size_factors(&sf, 3, BinStatistic::Median);
        assert!((median.values[0] - 2.0).abs() < 1e-12);

        let approx = approximate_size_factors(&sf, 3);
        assert_eq!(approx[5], 10.0);
        assert!((approx[1] - 2.0).abs() < 1e-12);

        let constant = bin_size_factors(&[4.0, 4.0], 30, BinStatistic::Mean);
        assert_eq!(constant.assignment, vec![0, 0]);
        assert_eq!(constant.values[0], 4.0);
    }
}
