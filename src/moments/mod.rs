//! Moment estimation per group
//!
//! Computes debiased means, variances and residual variances for every group
//! of a `GroupStore`, plus covariances and correlations for requested gene
//! pairs.

mod estimator;
mod trend;

pub use estimator::{corr_from_cov, MomentEstimator, Moments1d, NoiseModel, WeightedSupport};
pub use trend::{fit_with_fallback, TrendFit};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::GroupStore;
use crate::error::{MementoError, Result};
use crate::stats::weighted_nan_mean;

/// Parameters for 1D moment computation
#[derive(Debug, Clone)]
pub struct MomentParams {
    /// Number of bins for approximate size factors
    pub num_bins: usize,
    /// Minimum observed mean for a gene to count as expressed in a group
    pub filter_mean_thresh: f64,
    /// Fraction of groups (exclusive) in which a gene must be expressed
    pub min_perc_group: f64,
    /// Drop genes that fail the expression filter
    pub filter_genes: bool,
}

impl Default for MomentParams {
    fn default() -> Self {
        Self {
            num_bins: 30,
            filter_mean_thresh: 0.07,
            min_perc_group: 0.7,
            filter_genes: true,
        }
    }
}

/// Per-gene moments of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentSet {
    pub mean: Vec<f64>,
    /// May be negative; consumers treat non-positive values as invalid
    pub variance: Vec<f64>,
    pub residual_variance: Vec<f64>,
    pub trend: Option<TrendFit>,
}

impl MomentSet {
    pub fn new(moments: Moments1d, trend: Option<TrendFit>) -> Self {
        let residual_variance = match trend {
            Some(t) => t.residual_variances(&moments.mean, &moments.variance),
            None => vec![f64::NAN; moments.mean.len()],
        };
        Self {
            mean: moments.mean,
            variance: moments.variance,
            residual_variance,
            trend,
        }
    }
}

/// Covariance and correlation of gene pairs within one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairMoments {
    pub pairs: Vec<(usize, usize)>,
    pub cov: Vec<f64>,
    pub corr: Vec<f64>,
}

/// Statistic names used in flat moment tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    Variance,
    ResidualVariance,
    Cov,
    Corr,
}

/// One row of the flat moment table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentRecord {
    pub feature: String,
    pub group: String,
    pub statistic: Statistic,
    pub value: f64,
}

/// Cell-count weighted log moments of one gene at one metadata level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentSummary {
    pub gene: String,
    pub level: String,
    pub log_mean: f64,
    pub log_residual_variance: f64,
}

/// Cell-count weighted correlation of one gene pair at one metadata level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairMomentSummary {
    pub gene_1: String,
    pub gene_2: String,
    pub level: String,
    pub corr: f64,
}

/// Compute 1D moments for every group
///
/// Per-group moments are estimated first and, when `filter_genes` is set,
/// used to drop genes that are not expressed in enough groups. The all-cell
/// moments and trend are then computed on the retained genes and each group's
/// trend falls back to the all-cell trend when its own fit fails.
pub fn compute_1d_moments(store: &mut GroupStore, params: &MomentParams) -> Result<()> {
    let model = store.noise_model;

    let mut group_moments: Vec<Moments1d> = store
        .groups
        .par_iter()
        .map(|g| MomentEstimator::new(model, g.capture_rate).estimate_1d(&g.counts, &g.size_factor))
        .collect();

    if params.filter_genes && !store.groups.is_empty() {
        let n_genes = store.n_genes();
        let mut expressed_in = vec![0usize; n_genes];
        for (group, moments) in store.groups.iter().zip(&group_moments) {
            let observed = group.counts.gene_means();
            for j in 0..n_genes {
                if observed[j] > params.filter_mean_thresh && moments.variance[j] > 0.0 {
                    expressed_in[j] += 1;
                }
            }
        }

        let n_groups = store.groups.len() as f64;
        let keep: Vec<usize> = (0..n_genes)
            .filter(|&j| expressed_in[j] as f64 / n_groups > params.min_perc_group)
            .collect();
        log::info!("{} of {} genes pass the expression filter", keep.len(), n_genes);
        if keep.is_empty() {
            log::warn!("No genes pass the expression filter");
        }

        if keep.len() < n_genes {
            store.subset_genes(&keep)?;
            for m in &mut group_moments {
                m.mean = keep.iter().map(|&j| m.mean[j]).collect();
                m.variance = keep.iter().map(|&j| m.variance[j]).collect();
            }
        }
    }

    let global = MomentEstimator::new(model, store.capture_rate).estimate_1d(&store.counts, &store.size_factor);
    let global_trend = match TrendFit::fit(&global.mean, &global.variance) {
        Ok(t) => {
            log::debug!("All-cell trend: slope {:.4}, intercept {:.4}", t.slope, t.intercept);
            Some(t)
        }
        Err(e) => {
            log::warn!("All-cell trend fit failed: {}", e);
            None
        }
    };
    store.global_moments = Some(MomentSet::new(global, global_trend));

    for (group, moments) in store.groups.iter_mut().zip(group_moments) {
        let trend = fit_with_fallback(&group.key, &moments.mean, &moments.variance, global_trend);
        group.moments = Some(MomentSet::new(moments, trend));
        group.pair_moments = None;
    }

    Ok(())
}

/// Compute covariance and correlation for the given gene index pairs in every group
///
/// Requires 1D moments, whose variances form the correlation denominators.
pub fn compute_2d_moments(store: &mut GroupStore, gene_pairs: &[(usize, usize)]) -> Result<()> {
    let n_genes = store.n_genes();
    if let Some(&(a, b)) = gene_pairs.iter().find(|&&(a, b)| a >= n_genes || b >= n_genes) {
        return Err(MementoError::config(format!(
            "Gene pair ({}, {}) is out of range for {} genes",
            a, b, n_genes
        )));
    }
    if store.groups.iter().any(|g| g.moments.is_none()) {
        return Err(MementoError::config("1D moments must be computed before 2D moments"));
    }

    let model = store.noise_model;
    store.groups.par_iter_mut().for_each(|group| {
        let estimator = MomentEstimator::new(model, group.capture_rate);
        let cov = estimator.estimate_cov(&group.counts, &group.size_factor, gene_pairs);
        let corr = match &group.moments {
            Some(m) => gene_pairs
                .iter()
                .zip(&cov)
                .map(|(&(a, b), &c)| corr_from_cov(c, m.variance[a], m.variance[b]))
                .collect(),
            None => vec![f64::NAN; gene_pairs.len()],
        };
        group.pair_moments = Some(PairMoments {
            pairs: gene_pairs.to_vec(),
            cov,
            corr,
        });
    });

    Ok(())
}

/// Flatten every computed moment into (feature, group, statistic, value) rows
pub fn moment_table(store: &GroupStore) -> Vec<MomentRecord> {
    let genes = store.gene_ids();
    let mut records = Vec::new();

    for group in store.groups() {
        if let Some(m) = group.moments() {
            for (j, gene) in genes.iter().enumerate() {
                for (statistic, value) in [
                    (Statistic::Mean, m.mean[j]),
                    (Statistic::Variance, m.variance[j]),
                    (Statistic::ResidualVariance, m.residual_variance[j]),
                ] {
                    records.push(MomentRecord {
                        feature: gene.clone(),
                        group: group.key().to_string(),
                        statistic,
                        value,
                    });
                }
            }
        }

        if let Some(p) = group.pair_moments() {
            for (k, &(a, b)) in p.pairs.iter().enumerate() {
                let feature = format!("{}:{}", genes[a], genes[b]);
                for (statistic, value) in [(Statistic::Cov, p.cov[k]), (Statistic::Corr, p.corr[k])] {
                    records.push(MomentRecord {
                        feature: feature.clone(),
                        group: group.key().to_string(),
                        statistic,
                        value,
                    });
                }
            }
        }
    }

    records
}

/// Average log mean and log residual variance per level of one grouping column
///
/// Groups sharing a level are combined with cell-count weights; non-positive
/// moments are skipped.
pub fn summarize_1d_moments(store: &GroupStore, column: &str) -> Result<Vec<MomentSummary>> {
    let label_idx = store.label_index(column)?;
    if store.groups.iter().any(|g| g.moments.is_none()) {
        return Err(MementoError::config("1D moments must be computed before summarizing"));
    }

    let mut levels: Vec<&str> = store.groups.iter().map(|g| g.labels[label_idx].as_str()).collect();
    levels.sort_unstable();
    levels.dedup();

    let log_positive = |x: f64| if x > 0.0 { x.ln() } else { f64::NAN };
    let mut summary = Vec::with_capacity(levels.len() * store.n_genes());

    for level in levels {
        let members: Vec<(&MomentSet, f64)> = store
            .groups
            .iter()
            .filter(|g| g.labels[label_idx] == level)
            .filter_map(|g| g.moments.as_ref().map(|m| (m, g.cell_count() as f64)))
            .collect();
        let weights: Vec<f64> = members.iter().map(|(_, w)| *w).collect();

        for (j, gene) in store.gene_ids().iter().enumerate() {
            let log_mean: Vec<f64> = members.iter().map(|(m, _)| log_positive(m.mean[j])).collect();
            let log_res: Vec<f64> = members
                .iter()
                .map(|(m, _)| log_positive(m.residual_variance[j]))
                .collect();
            summary.push(MomentSummary {
                gene: gene.clone(),
                level: level.to_string(),
                log_mean: weighted_nan_mean(&log_mean, &weights),
                log_residual_variance: weighted_nan_mean(&log_res, &weights),
            });
        }
    }

    Ok(summary)
}

/// Average pair correlations per level of one grouping column
///
/// Groups sharing a level are combined with cell-count weights; NaN
/// correlations are skipped.
pub fn summarize_2d_moments(store: &GroupStore, column: &str) -> Result<Vec<PairMomentSummary>> {
    let label_idx = store.label_index(column)?;
    let Some(pairs) = store.groups.first().and_then(|g| g.pair_moments.as_ref()).map(|p| p.pairs.clone()) else {
        return Err(MementoError::config("2D moments must be computed before summarizing"));
    };
    if store.groups.iter().any(|g| g.pair_moments.is_none()) {
        return Err(MementoError::config("2D moments must be computed before summarizing"));
    }

    let mut levels: Vec<&str> = store.groups.iter().map(|g| g.labels[label_idx].as_str()).collect();
    levels.sort_unstable();
    levels.dedup();

    let genes = store.gene_ids();
    let mut summary = Vec::with_capacity(levels.len() * pairs.len());

    for level in levels {
        let members: Vec<(&PairMoments, f64)> = store
            .groups
            .iter()
            .filter(|g| g.labels[label_idx] == level)
            .filter_map(|g| g.pair_moments.as_ref().map(|p| (p, g.cell_count() as f64)))
            .collect();
        let weights: Vec<f64> = members.iter().map(|(_, w)| *w).collect();

        for (k, &(a, b)) in pairs.iter().enumerate() {
            let corr: Vec<f64> = members.iter().map(|(p, _)| p.corr[k]).collect();
            summary.push(PairMomentSummary {
                gene_1: genes[a].clone(),
                gene_2: genes[b].clone(),
                level: level.to_string(),
                corr: weighted_nan_mean(&corr, &weights),
            });
        }
    }

    Ok(summary)
}
