//! rust_memento: method-of-moments estimation and bootstrap hypothesis testing
//! for single-cell count data
//!
//! Cells are partitioned into groups by their metadata labels. Within each
//! group, noise-aware moment estimators recover the mean, variance and
//! covariance of the latent expression; a compressed bootstrap yields
//! replicate moments that are regressed on a group-level design to test for
//! differential mean, variability and correlation.
//!
//! # Example
//!
//! ```ignore
//! use rust_memento::prelude::*;
//!
//! let counts = read_count_matrix("counts.csv")?;
//! let metadata = read_metadata("cells.csv")?;
//! let dataset = Dataset::new(counts, metadata)?;
//!
//! let store = prepare_groups(
//!     &dataset,
//!     &["stim".to_string(), "ind".to_string()],
//!     Some("q"),
//!     NoiseModel::HypergeometricRelative,
//!     &SizeFactorParams::default(),
//!     &MomentParams::default(),
//! )?;
//!
//! let design = build_design_matrix(&store, "1 + stim + ind", "stim")?;
//! let results = test_1d(&store, &design, &TestParams::default())?;
//! ```

pub mod bootstrap;
pub mod cli;
pub mod data;
pub mod error;
pub mod glm;
pub mod io;
pub mod moments;
pub mod normalization;
pub mod rng;
pub mod stats;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bootstrap::BootstrapParams;
    pub use crate::data::{CellMetadata, CountMatrix, Dataset, GroupSlice, GroupStore};
    pub use crate::error::{MementoError, Result};
    pub use crate::glm::{build_design_matrix, DesignMatrix};
    pub use crate::io::{
        read_count_matrix, read_gene_pairs, read_metadata, write_table, OneDResult, OutputFormat, TestSummary,
        TwoDResult,
    };
    pub use crate::moments::{
        compute_1d_moments, compute_2d_moments, moment_table, summarize_1d_moments, summarize_2d_moments, MomentParams,
        NoiseModel,
    };
    pub use crate::normalization::{compute_size_factors, estimate_size_factor, SizeFactorParams};
    pub use crate::testing::{test_1d, test_2d, AslParams, TestParams, TestStatus};
    pub use crate::prepare_groups;
}

use prelude::*;

/// Build groups and compute size factors and 1D moments
///
/// `moment_params.num_bins` also sets the number of bins of the approximate
/// size factors.
pub fn prepare_groups(
    dataset: &Dataset,
    label_columns: &[String],
    q_column: Option<&str>,
    noise_model: NoiseModel,
    sf_params: &SizeFactorParams,
    moment_params: &MomentParams,
) -> Result<GroupStore> {
    let mut store = GroupStore::create(dataset, label_columns, q_column, noise_model)?;
    compute_size_factors(&mut store, sf_params, moment_params.num_bins)?;
    compute_1d_moments(&mut store, moment_params)?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::UntestableReason;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Gamma, Poisson};

    fn dataset(dense: Array2<f64>, labels: &[(&str, Vec<String>)], q: Option<f64>) -> Dataset {
        let (n_cells, n_genes) = dense.dim();
        let cells: Vec<String> = (0..n_cells).map(|i| format!("cell{}", i)).collect();
        let genes: Vec<String> = (0..n_genes).map(|j| format!("gene{}", j)).collect();
        let counts = CountMatrix::from_dense(dense.view(), genes, cells.clone()).unwrap();
        let mut meta = CellMetadata::new(cells);
        for (name, values) in labels {
            meta.add_condition(name, values.clone()).unwrap();
        }
        if let Some(q) = q {
            meta.add_continuous("q", vec![q; n_cells]).unwrap();
        }
        Dataset::new(counts, meta).unwrap()
    }

    /// Two groups of 500 cells, one gene, Poisson(lambda) per group
    fn two_group_store(ctrl: &[f64], stim: &[f64]) -> GroupStore {
        let n = ctrl.len() + stim.len();
        let dense = Array2::from_shape_fn((n, 1), |(i, _)| if i < ctrl.len() { ctrl[i] } else { stim[i - ctrl.len()] });
        let cond: Vec<String> = (0..n)
            .map(|i| if i < ctrl.len() { "ctrl" } else { "stim" }.to_string())
            .collect();
        let ds = dataset(dense, &[("cond", cond)], None);
        prepare_groups(
            &ds,
            &["cond".to_string()],
            None,
            NoiseModel::PoissonAbsolute,
            &SizeFactorParams::default(),
            &MomentParams::default(),
        )
        .unwrap()
    }

    fn poisson_counts(lambda: f64, n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let poisson = Poisson::new(lambda).unwrap();
        (0..n).map(|_| poisson.sample(&mut rng)).collect()
    }

    fn params(num_boot: usize) -> TestParams {
        TestParams {
            bootstrap: BootstrapParams {
                num_boot,
                ..BootstrapParams::default()
            },
            seed: 11,
            ..TestParams::default()
        }
    }

    #[test]
    fn test_identical_groups_are_not_significant() {
        let counts = poisson_counts(5.0, 500, 1);
        let store = two_group_store(&counts, &counts);
        let design = build_design_matrix(&store, "1 + cond", "cond").unwrap();

        let results = test_1d(&store, &design, &params(2000)).unwrap();
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.de_status, TestStatus::AslComputed);
        assert!(r.de_coef.abs() < 1e-10);
        assert!(r.de_pval > 0.1);
    }

    #[test]
    fn test_shifted_mean_is_significant() {
        let ctrl = poisson_counts(5.0, 500, 2);
        let stim = poisson_counts(20.0, 500, 3);
        let store = two_group_store(&ctrl, &stim);
        let design = build_design_matrix(&store, "1 + cond", "cond").unwrap();

        let results = test_1d(&store, &design, &params(2000)).unwrap();
        let r = &results[0];
        assert_eq!(r.de_status, TestStatus::AslComputed);
        assert!((r.de_coef - 4.0f64.ln()).abs() < 0.15);
        assert!(r.de_pval < 0.05);
    }

    #[test]
    fn test_results_are_reproducible_for_a_seed() {
        let ctrl = poisson_counts(5.0, 300, 4);
        let stim = poisson_counts(6.0, 300, 5);
        let store = two_group_store(&ctrl, &stim);
        let design = build_design_matrix(&store, "1 + cond", "cond").unwrap();

        let a = test_1d(&store, &design, &params(300)).unwrap();
        let b = test_1d(&store, &design, &params(300)).unwrap();
        assert_eq!(a[0].de_pval.to_bits(), b[0].de_pval.to_bits());
        assert_eq!(a[0].de_coef.to_bits(), b[0].de_coef.to_bits());
    }

    /// Two correlated genes sharing a latent Gamma factor, plus an independent one
    fn correlated_store() -> GroupStore {
        let n = 600;
        let mut rng = StdRng::seed_from_u64(21);
        let mut dense = Array2::zeros((n, 3));
        for i in 0..n {
            let shape = if i < n / 2 { 2.0 } else { 0.7 };
            let z = Gamma::new(shape, 2.0 / shape).unwrap().sample(&mut rng);
            let w = Gamma::new(5.0, 0.2).unwrap().sample(&mut rng);
            dense[[i, 0]] = Poisson::new(2.0 * z + 1e-9).unwrap().sample(&mut rng);
            dense[[i, 1]] = Poisson::new(3.0 * z * w + 1e-9).unwrap().sample(&mut rng);
            dense[[i, 2]] = Poisson::new(4.0).unwrap().sample(&mut rng);
        }
        let cond: Vec<String> = (0..n)
            .map(|i| if i < n / 2 { "ctrl" } else { "stim" }.to_string())
            .collect();
        let ds = dataset(dense, &[("cond", cond)], None);
        prepare_groups(
            &ds,
            &["cond".to_string()],
            None,
            NoiseModel::PoissonAbsolute,
            &SizeFactorParams::default(),
            &MomentParams {
                filter_genes: false,
                ..MomentParams::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_pairs_share_one_result() {
        let store = correlated_store();
        let design = build_design_matrix(&store, "1 + cond", "cond").unwrap();
        let pairs = [(0, 1), (1, 0), (0, 2), (0, 1), (2, 2)];

        let results = test_2d(&store, &design, &pairs, &params(200)).unwrap();
        assert_eq!(results.len(), 5);
        for k in [1, 3] {
            assert_eq!(results[k].corr_coef.to_bits(), results[0].corr_coef.to_bits());
            assert_eq!(results[k].corr_pval.to_bits(), results[0].corr_pval.to_bits());
            assert_eq!(results[k].status, results[0].status);
        }
        assert_eq!((results[1].gene_1.as_str(), results[1].gene_2.as_str()), ("gene1", "gene0"));
        assert_eq!(results[4].status, TestStatus::Untestable(UntestableReason::SelfPair));
        assert!(results[4].corr_coef.is_nan());

        // Correlation driven by a shared latent factor is tested and finite
        assert_eq!(results[0].status, TestStatus::AslComputed);
        assert!(results[0].corr_coef.is_finite());
    }

    #[test]
    fn test_hypergeometric_relative_pipeline() {
        let n_per = 150;
        let groups = [("ctrl", "1"), ("stim", "1"), ("ctrl", "2"), ("stim", "2")];
        let n = n_per * groups.len();
        let n_genes = 8;
        let mut rng = StdRng::seed_from_u64(31);
        let mut dense = Array2::zeros((n, n_genes));
        let mut stim = Vec::with_capacity(n);
        let mut ind = Vec::with_capacity(n);
        for i in 0..n {
            let (s, d) = groups[i / n_per];
            stim.push(s.to_string());
            ind.push(d.to_string());
            for j in 0..n_genes {
                let mut mean = 3.0 + j as f64;
                if j == 2 && s == "stim" {
                    mean *= 3.0;
                }
                let z = Gamma::new(2.0, mean / 2.0).unwrap().sample(&mut rng);
                dense[[i, j]] = Poisson::new(z + 1e-9).unwrap().sample(&mut rng);
            }
        }
        let ds = dataset(dense, &[("stim", stim), ("ind", ind)], Some(0.1));
        let store = prepare_groups(
            &ds,
            &["stim".to_string(), "ind".to_string()],
            Some("q"),
            NoiseModel::HypergeometricRelative,
            &SizeFactorParams::default(),
            &MomentParams::default(),
        )
        .unwrap();
        assert_eq!(store.groups().len(), 4);
        assert_eq!(store.n_genes(), n_genes);

        let design = build_design_matrix(&store, "1 + stim + ind", "stim").unwrap();
        let results = test_1d(&store, &design, &params(200)).unwrap();
        assert_eq!(results.len(), n_genes);
        assert_eq!(results[2].gene, "gene2");
        assert_eq!(results[2].de_status, TestStatus::AslComputed);
        assert!(results[2].de_coef > 0.5);
        assert!(results[2].de_pval < 0.05);

        let table = moment_table(&store);
        assert_eq!(table.len(), 3 * n_genes * 4);
    }

    #[test]
    fn test_missing_covariate_is_a_configuration_error() {
        let counts = poisson_counts(5.0, 50, 6);
        let store = two_group_store(&counts, &counts);
        let err = build_design_matrix(&store, "1 + cond", "dose").unwrap_err();
        assert!(err.is_configuration());
    }
}
