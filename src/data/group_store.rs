//! Cell groups built from metadata labels
//!
//! A `GroupStore` owns every per-group count slice together with its size
//! factors, capture rate and computed moments. Components take it by
//! reference and update it through the setters below.

use std::collections::HashMap;

use super::{CountMatrix, Dataset};
use crate::error::{MementoError, Result};
use crate::moments::{MomentSet, NoiseModel, PairMoments};
use crate::normalization::{approximate_size_factors, estimate_size_factor, SizeFactorParams};

/// Separator between label values in a group key
pub const GROUP_DELIMITER: &str = "^";

/// Prefix shared by all group keys
pub const GROUP_PREFIX: &str = "sg";

/// Default number of bins for approximate size factors
pub const DEFAULT_SF_BINS: usize = 30;

/// One group of cells sharing the same label values
#[derive(Debug, Clone)]
pub struct Group {
    pub(crate) key: String,
    pub(crate) labels: Vec<String>,
    pub(crate) cell_indices: Vec<usize>,
    pub(crate) counts: CountMatrix,
    pub(crate) capture_rate: f64,
    pub(crate) size_factor: Vec<f64>,
    pub(crate) approx_size_factor: Vec<f64>,
    pub(crate) moments: Option<MomentSet>,
    pub(crate) pair_moments: Option<PairMoments>,
}

impl Group {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Label values in the order of the store's label columns
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Row indices of this group's cells in the full dataset
    pub fn cell_indices(&self) -> &[usize] {
        &self.cell_indices
    }

    pub fn cell_count(&self) -> usize {
        self.cell_indices.len()
    }

    pub fn capture_rate(&self) -> f64 {
        self.capture_rate
    }

    pub fn moments(&self) -> Option<&MomentSet> {
        self.moments.as_ref()
    }

    pub fn pair_moments(&self) -> Option<&PairMoments> {
        self.pair_moments.as_ref()
    }

    pub fn slice(&self) -> GroupSlice<'_> {
        GroupSlice {
            counts: &self.counts,
            size_factor: &self.size_factor,
            approx_size_factor: &self.approx_size_factor,
            capture_rate: self.capture_rate,
            cell_count: self.cell_count(),
        }
    }
}

/// Read-only view of one group's data
#[derive(Debug, Clone, Copy)]
pub struct GroupSlice<'a> {
    pub counts: &'a CountMatrix,
    pub size_factor: &'a [f64],
    pub approx_size_factor: &'a [f64],
    pub capture_rate: f64,
    pub cell_count: usize,
}

/// All groups of a dataset plus the all-cell quantities they fall back on
#[derive(Debug, Clone)]
pub struct GroupStore {
    pub(crate) counts: CountMatrix,
    pub(crate) noise_model: NoiseModel,
    pub(crate) label_columns: Vec<String>,
    pub(crate) capture_rate: f64,
    pub(crate) size_factor: Vec<f64>,
    pub(crate) groups: Vec<Group>,
    pub(crate) global_moments: Option<MomentSet>,
}

impl GroupStore {
    /// Partition cells by the values of `label_columns`
    ///
    /// Group keys are `sg^v1^v2...`, ordered by first appearance. Hypergeometric
    /// models need a per-cell capture probability column `q_column` with values
    /// in [0, 1); Poisson models ignore it and use a capture rate of 0.
    pub fn create(
        dataset: &Dataset,
        label_columns: &[String],
        q_column: Option<&str>,
        noise_model: NoiseModel,
    ) -> Result<Self> {
        let metadata = dataset.metadata();
        let n_cells = dataset.n_cells();

        let columns = label_columns
            .iter()
            .map(|name| {
                metadata
                    .condition(name)
                    .ok_or_else(|| MementoError::config(format!("Label column '{}' not found in metadata", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let q: Vec<f64> = if noise_model.is_hypergeometric() {
            let name = q_column.ok_or_else(|| {
                MementoError::config(format!("Noise model {} requires a capture rate column", noise_model))
            })?;
            let values = metadata
                .continuous(name)
                .ok_or_else(|| MementoError::config(format!("Capture rate column '{}' not found", name)))?;
            if let Some(bad) = values.iter().find(|&&v| !(0.0..1.0).contains(&v)) {
                return Err(MementoError::config(format!(
                    "Capture rates must lie in [0, 1), found {}",
                    bad
                )));
            }
            values.clone()
        } else {
            if q_column.is_some() {
                log::info!("Capture rate column is ignored under the {} model", noise_model);
            }
            vec![0.0; n_cells]
        };

        // Group cells by label tuple, preserving first-appearance order
        let mut order: Vec<Vec<String>> = Vec::new();
        let mut members: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
        for cell in 0..n_cells {
            let labels: Vec<String> = columns.iter().map(|c| c[cell].clone()).collect();
            members
                .entry(labels.clone())
                .or_insert_with(|| {
                    order.push(labels);
                    Vec::new()
                })
                .push(cell);
        }

        let counts = dataset.counts().clone();
        let capture_rate = if n_cells > 0 {
            q.iter().sum::<f64>() / n_cells as f64
        } else {
            0.0
        };

        let mut groups = Vec::with_capacity(order.len());
        for labels in order {
            let cell_indices = members.remove(&labels).unwrap_or_default();
            let group_q = cell_indices.iter().map(|&i| q[i]).sum::<f64>() / cell_indices.len() as f64;
            groups.push(Group {
                key: group_key(&labels),
                counts: counts.subset_cells(&cell_indices)?,
                labels,
                capture_rate: group_q,
                size_factor: Vec::new(),
                approx_size_factor: Vec::new(),
                cell_indices,
                moments: None,
                pair_moments: None,
            });
        }

        log::info!(
            "Created {} groups from {} cells over columns {:?}",
            groups.len(),
            n_cells,
            label_columns
        );

        let mut store = Self {
            counts,
            noise_model,
            label_columns: label_columns.to_vec(),
            capture_rate,
            size_factor: Vec::new(),
            groups,
            global_moments: None,
        };
        // Plain per-cell totals until trimmed factors are requested
        store.set_size_factors(
            estimate_size_factor(
                &store.counts,
                noise_model,
                capture_rate,
                &SizeFactorParams {
                    shrinkage: 1.0,
                    ..SizeFactorParams::default()
                },
            ),
            DEFAULT_SF_BINS,
        )?;
        Ok(store)
    }

    /// Replace all-cell size factors and redistribute them to groups
    pub fn set_size_factors(&mut self, size_factor: Vec<f64>, num_bins: usize) -> Result<()> {
        if size_factor.len() != self.counts.n_cells() {
            return Err(MementoError::DimensionMismatch {
                expected: format!("{} size factors", self.counts.n_cells()),
                got: format!("{} size factors", size_factor.len()),
            });
        }

        let approx = if self.noise_model.is_relative() {
            approximate_size_factors(&size_factor, num_bins)
        } else {
            size_factor.clone()
        };

        for group in &mut self.groups {
            group.size_factor = group.cell_indices.iter().map(|&i| size_factor[i]).collect();
            group.approx_size_factor = group.cell_indices.iter().map(|&i| approx[i]).collect();
            group.moments = None;
            group.pair_moments = None;
        }
        self.size_factor = size_factor;
        self.global_moments = None;
        Ok(())
    }

    /// Keep only the given gene columns in every slice; computed moments are dropped
    pub fn subset_genes(&mut self, gene_indices: &[usize]) -> Result<()> {
        self.counts = self.counts.subset_genes(gene_indices)?;
        for group in &mut self.groups {
            group.counts = group.counts.subset_genes(gene_indices)?;
            group.moments = None;
            group.pair_moments = None;
        }
        self.global_moments = None;
        Ok(())
    }

    pub fn noise_model(&self) -> NoiseModel {
        self.noise_model
    }

    pub fn label_columns(&self) -> &[String] {
        &self.label_columns
    }

    /// Mean capture rate over all cells
    pub fn capture_rate(&self) -> f64 {
        self.capture_rate
    }

    /// All-cell count matrix
    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    pub fn size_factor(&self) -> &[f64] {
        &self.size_factor
    }

    pub fn gene_ids(&self) -> &[String] {
        self.counts.gene_ids()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.n_genes()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group_keys(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.key.as_str()).collect()
    }

    /// Moments over all cells, with the all-cell trend
    pub fn global_moments(&self) -> Option<&MomentSet> {
        self.global_moments.as_ref()
    }

    pub fn group(&self, group_id: &str) -> Result<&Group> {
        self.groups
            .iter()
            .find(|g| g.key == group_id)
            .ok_or_else(|| MementoError::config(format!("Unknown group '{}'", group_id)))
    }

    /// Counts, size factors and capture rate of one group
    pub fn get_group_slice(&self, group_id: &str) -> Result<GroupSlice<'_>> {
        Ok(self.group(group_id)?.slice())
    }

    /// Map gene names to column indices of the current (possibly filtered) matrix
    pub fn resolve_gene_indices(&self, gene_names: &[String]) -> Result<Vec<usize>> {
        super::resolve_gene_indices(self.counts.gene_ids(), gene_names)
    }

    /// Map (gene, gene) name pairs to column index pairs
    pub fn resolve_gene_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<(usize, usize)>> {
        let (first, second): (Vec<String>, Vec<String>) = pairs.iter().cloned().unzip();
        let first = self.resolve_gene_indices(&first)?;
        let second = self.resolve_gene_indices(&second)?;
        Ok(first.into_iter().zip(second).collect())
    }

    /// Position of a label column
    pub fn label_index(&self, column: &str) -> Result<usize> {
        self.label_columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| MementoError::config(format!("'{}' is not a grouping column", column)))
    }
}

/// Build a group key from label values
pub fn group_key(labels: &[String]) -> String {
    std::iter::once(GROUP_PREFIX)
        .chain(labels.iter().map(|s| s.as_str()))
        .collect::<Vec<_>>()
        .join(GROUP_DELIMITER)
}
