//! Bootstrap hypothesis tests for differential mean, variability and correlation
//!
//! For every gene (1D) or unique gene pair (2D) the bootstrap samples of all
//! valid groups are stacked into a groups x (num_boot + 1) matrix, regressed on
//! the design with cell-count weights, and the covariate coefficients of the
//! replicate columns form the reference distribution for the ASL.

mod asl;
mod gev;

pub use asl::{compute_asl, empirical_asl, AslParams};
pub use gev::{fit_gev, ks_test, GevParams};

use std::fmt;

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Serialize, Serializer};

use crate::bootstrap::{bootstrap_1d, bootstrap_2d, BootstrapParams, BootstrapSample, TrueMoments, TruePairMoments};
use crate::data::GroupStore;
use crate::error::{MementoError, Result};
use crate::glm::{DesignMatrix, WeightedLeastSquares};
use crate::io::{OneDResult, TwoDResult};
use crate::moments::{corr_from_cov, MomentEstimator};
use crate::rng::task_rng;

/// Parameters for hypothesis tests
#[derive(Debug, Clone)]
pub struct TestParams {
    pub bootstrap: BootstrapParams,
    pub asl: AslParams,
    /// Base seed; each gene or pair derives its own stream from it
    pub seed: u64,
    /// Fraction of bootstrap columns that must be finite in every valid group
    pub min_valid_fraction: f64,
    /// Groups with a larger fraction of non-finite correlation replicates are skipped
    pub max_group_nan_fraction: f64,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapParams::default(),
            asl: AslParams::default(),
            seed: 0,
            min_valid_fraction: 0.5,
            max_group_nan_fraction: 0.2,
        }
    }
}

/// Why a statistic could not be tested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntestableReason {
    NoValidGroups,
    CovariateNotRepresented,
    UnstableBootstrap,
    RegressionFailed,
    SelfPair,
}

impl UntestableReason {
    fn as_str(self) -> &'static str {
        match self {
            UntestableReason::NoValidGroups => "no_valid_groups",
            UntestableReason::CovariateNotRepresented => "covariate_not_represented",
            UntestableReason::UnstableBootstrap => "unstable_bootstrap",
            UntestableReason::RegressionFailed => "regression_failed",
            UntestableReason::SelfPair => "self_pair",
        }
    }
}

/// Terminal state of one tested statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    AslComputed,
    Untestable(UntestableReason),
}

impl TestStatus {
    pub fn is_tested(&self) -> bool {
        matches!(self, TestStatus::AslComputed)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::AslComputed => f.write_str("asl_computed"),
            TestStatus::Untestable(reason) => write!(f, "untestable:{}", reason.as_str()),
        }
    }
}

impl Serialize for TestStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Coefficient, ASL and status of one statistic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticOutcome {
    pub coef: f64,
    pub asl: f64,
    pub status: TestStatus,
}

impl StatisticOutcome {
    fn untestable(reason: UntestableReason) -> Self {
        Self {
            coef: f64::NAN,
            asl: f64::NAN,
            status: TestStatus::Untestable(reason),
        }
    }
}

/// Regress one statistic's bootstrap samples over its valid groups
///
/// `rows` pairs design row indices with the samples of those groups.
pub fn regress_statistic(design: &DesignMatrix, rows: &[(usize, &BootstrapSample)], params: &TestParams) -> StatisticOutcome {
    if rows.is_empty() {
        return StatisticOutcome::untestable(UntestableReason::NoValidGroups);
    }

    let row_idx: Vec<usize> = rows.iter().map(|(r, _)| *r).collect();
    let sub = design.select_groups(&row_idx);
    if !sub.covariate_varies() {
        return StatisticOutcome::untestable(UntestableReason::CovariateNotRepresented);
    }

    // Keep bootstrap columns that are finite in every group
    let n_columns = rows[0].1.values.len();
    let kept: Vec<usize> = (0..n_columns)
        .filter(|&k| rows.iter().all(|(_, s)| s.values[k].is_finite()))
        .collect();
    if (kept.len() as f64) < params.min_valid_fraction * n_columns as f64 || kept.first() != Some(&0) || kept.len() < 2 {
        return StatisticOutcome::untestable(UntestableReason::UnstableBootstrap);
    }

    let y = Array2::from_shape_fn((rows.len(), kept.len()), |(i, k)| rows[i].1.values[kept[k]]);
    let wls = match WeightedLeastSquares::new(sub.matrix.view(), &sub.weights) {
        Ok(wls) => wls,
        Err(e) => {
            log::debug!("Regression failed: {}", e);
            return StatisticOutcome::untestable(UntestableReason::RegressionFailed);
        }
    };

    let coefs = wls.coefficient(sub.covariate_index, y.view());
    let reference = coefs.slice(ndarray::s![1..]).to_vec();
    StatisticOutcome {
        coef: coefs[0],
        asl: compute_asl(&reference, &params.asl),
        status: TestStatus::AslComputed,
    }
}

fn sample_refs(rows: &[(usize, BootstrapSample)]) -> Vec<(usize, &BootstrapSample)> {
    rows.iter().map(|(g, s)| (*g, s)).collect()
}

fn check_inputs(store: &GroupStore, design: &DesignMatrix) -> Result<()> {
    if design.n_groups() != store.groups().len() {
        return Err(MementoError::DimensionMismatch {
            expected: format!("{} design rows", store.groups().len()),
            got: format!("{} design rows", design.n_groups()),
        });
    }
    if store.groups().iter().any(|g| g.moments().is_none()) {
        return Err(MementoError::config("1D moments must be computed before testing"));
    }
    Ok(())
}

/// Differential mean and variability test for every gene of the store
pub fn test_1d(store: &GroupStore, design: &DesignMatrix, params: &TestParams) -> Result<Vec<OneDResult>> {
    check_inputs(store, design)?;
    let model = store.noise_model();
    let gene_ids = store.gene_ids();

    log::info!(
        "Testing {} genes over {} groups with {} bootstrap replicates",
        gene_ids.len(),
        design.n_groups(),
        params.bootstrap.num_boot
    );

    let results: Vec<OneDResult> = (0..store.n_genes())
        .into_par_iter()
        .map(|gene| {
            let mut mean_rows = Vec::new();
            let mut var_rows = Vec::new();

            for (g, group) in store.groups().iter().enumerate() {
                let Some(m) = group.moments() else { continue };
                let (mean, variance, residual) = (m.mean[gene], m.variance[gene], m.residual_variance[gene]);
                let mean_valid = mean.is_finite() && mean > 0.0;
                let var_valid = residual.is_finite() && residual > 0.0;
                if !mean_valid && !var_valid {
                    continue;
                }

                let mut rng = task_rng(params.seed, gene as u64, g as u64);
                match bootstrap_1d(
                    &mut rng,
                    &group.slice(),
                    gene,
                    TrueMoments { mean, variance },
                    m.trend,
                    model,
                    &params.bootstrap,
                ) {
                    Ok(boot) => {
                        if mean_valid {
                            mean_rows.push((g, boot.log_mean));
                        }
                        if var_valid {
                            var_rows.push((g, boot.log_residual_variance));
                        }
                    }
                    Err(e) => log::debug!("Bootstrap of {} in {} failed: {}", gene_ids[gene], group.key(), e),
                }
            }

            let de = regress_statistic(design, &sample_refs(&mean_rows), params);
            let dv = regress_statistic(design, &sample_refs(&var_rows), params);

            OneDResult {
                gene: gene_ids[gene].clone(),
                de_coef: de.coef,
                de_pval: de.asl,
                dv_coef: dv.coef,
                dv_pval: dv.asl,
                de_status: de.status,
                dv_status: dv.status,
            }
        })
        .collect();

    let tested = results.iter().filter(|r| r.de_status.is_tested()).count();
    log::info!("{} of {} genes tested for differential mean", tested, results.len());
    Ok(results)
}

/// Unique unordered gene pairs and the mapping back to the requested list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairPlan {
    /// Unique pairs with the smaller index first
    pub unique: Vec<(usize, usize)>,
    /// For every requested pair, its position in `unique` (None for self pairs)
    pub assignment: Vec<Option<usize>>,
}

impl PairPlan {
    pub fn new(pairs: &[(usize, usize)]) -> Self {
        let mut index = std::collections::HashMap::new();
        let mut unique = Vec::new();
        let assignment = pairs
            .iter()
            .map(|&(a, b)| {
                if a == b {
                    return None;
                }
                let key = (a.min(b), a.max(b));
                Some(*index.entry(key).or_insert_with(|| {
                    unique.push(key);
                    unique.len() - 1
                }))
            })
            .collect();
        Self { unique, assignment }
    }
}

/// Differential correlation test for the requested gene pairs
///
/// Each unordered pair is tested once and its result is copied to every
/// occurrence in `gene_pairs`. Self pairs are reported as untestable.
pub fn test_2d(
    store: &GroupStore,
    design: &DesignMatrix,
    gene_pairs: &[(usize, usize)],
    params: &TestParams,
) -> Result<Vec<TwoDResult>> {
    check_inputs(store, design)?;
    let n_genes = store.n_genes();
    if let Some(&(a, b)) = gene_pairs.iter().find(|&&(a, b)| a >= n_genes || b >= n_genes) {
        return Err(MementoError::config(format!(
            "Gene pair ({}, {}) is out of range for {} genes",
            a, b, n_genes
        )));
    }

    let model = store.noise_model();
    let plan = PairPlan::new(gene_pairs);
    log::info!(
        "Testing {} unique gene pairs ({} requested) over {} groups",
        plan.unique.len(),
        gene_pairs.len(),
        design.n_groups()
    );

    let outcomes: Vec<StatisticOutcome> = plan
        .unique
        .par_iter()
        .enumerate()
        .map(|(task, &(a, b))| {
            let mut rows = Vec::new();

            for (g, group) in store.groups().iter().enumerate() {
                let Some(m) = group.moments() else { continue };
                let slice = group.slice();
                let estimator = MomentEstimator::new(model, slice.capture_rate);
                let cov = estimator.estimate_pair(
                    slice.counts.gene_column(a),
                    slice.counts.gene_column(b),
                    false,
                    slice.cell_count,
                    slice.size_factor,
                );
                let corr = corr_from_cov(cov, m.variance[a], m.variance[b]);
                if !corr.is_finite() || corr.abs() >= 1.0 {
                    continue;
                }

                let truth = TruePairMoments {
                    variance_1: m.variance[a],
                    variance_2: m.variance[b],
                    corr,
                };
                let mut rng = task_rng(params.seed, task as u64, g as u64);
                match bootstrap_2d(&mut rng, &slice, (a, b), truth, model, &params.bootstrap) {
                    Ok(boot) if boot.nan_fraction <= params.max_group_nan_fraction => rows.push((g, boot.corr)),
                    Ok(boot) => log::debug!(
                        "Skipping group {} for pair ({}, {}): {:.0}% of correlation replicates are NaN",
                        group.key(),
                        a,
                        b,
                        100.0 * boot.nan_fraction
                    ),
                    Err(e) => log::debug!("Bootstrap of pair ({}, {}) in {} failed: {}", a, b, group.key(), e),
                }
            }

            regress_statistic(design, &sample_refs(&rows), params)
        })
        .collect();

    let gene_ids = store.gene_ids();
    Ok(gene_pairs
        .iter()
        .zip(&plan.assignment)
        .map(|(&(a, b), assigned)| {
            let outcome = match assigned {
                Some(k) => outcomes[*k],
                None => StatisticOutcome::untestable(UntestableReason::SelfPair),
            };
            TwoDResult {
                gene_1: gene_ids[a].clone(),
                gene_2: gene_ids[b].clone(),
                corr_coef: outcome.coef,
                corr_pval: outcome.asl,
                status: outcome.status,
            }
        })
        .collect())
}
