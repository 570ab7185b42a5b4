//! Sparse count matrix representation for single-cell data

use std::collections::HashMap;

use nalgebra_sparse::{CooMatrix, CscMatrix};
use ndarray::ArrayView2;

use crate::error::{MementoError, Result};

/// Deduplicate names by appending _1, _2, etc. to duplicates
fn deduplicate_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for name in &names {
        *seen.entry(name.clone()).or_insert(0) += 1;
    }
    if !seen.values().any(|&c| c > 1) {
        return names;
    }
    seen.clear();
    let mut result = Vec::with_capacity(names.len());
    for name in names {
        let count = seen.entry(name.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            result.push(name);
        } else {
            let new_name = format!("{}_{}", name, *count - 1);
            log::warn!("Duplicate gene name '{}' renamed to '{}'", name, new_name);
            result.push(new_name);
        }
    }
    result
}

/// Rebuild a CSC matrix from per-column (row, value) lists, dropping explicit zeros
fn csc_from_columns(n_rows: usize, columns: Vec<Vec<(usize, f64)>>) -> Result<CscMatrix<f64>> {
    let n_cols = columns.len();
    let mut col_offsets = Vec::with_capacity(n_cols + 1);
    let mut row_indices = Vec::new();
    let mut values = Vec::new();
    col_offsets.push(0);
    for mut column in columns {
        column.sort_by_key(|&(row, _)| row);
        for (row, value) in column {
            if value != 0.0 {
                row_indices.push(row);
                values.push(value);
            }
        }
        col_offsets.push(row_indices.len());
    }
    CscMatrix::try_from_csc_data(n_rows, n_cols, col_offsets, row_indices, values).map_err(|e| {
        MementoError::InvalidCountMatrix {
            reason: format!("Malformed sparse structure: {}", e),
        }
    })
}

/// A cell x gene count matrix stored column-compressed (one column per gene)
#[derive(Debug, Clone)]
pub struct CountMatrix {
    /// Raw counts (cells x genes)
    counts: CscMatrix<f64>,
    /// Gene identifiers (columns)
    gene_ids: Vec<String>,
    /// Cell identifiers (rows)
    cell_ids: Vec<String>,
}

impl CountMatrix {
    /// Create a new count matrix from a sparse cells x genes matrix
    pub fn new(counts: CscMatrix<f64>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        let (n_cells, n_genes) = (counts.nrows(), counts.ncols());

        if gene_ids.len() != n_genes {
            return Err(MementoError::DimensionMismatch {
                expected: format!("{} gene IDs", n_genes),
                got: format!("{} gene IDs", gene_ids.len()),
            });
        }

        if cell_ids.len() != n_cells {
            return Err(MementoError::DimensionMismatch {
                expected: format!("{} cell IDs", n_cells),
                got: format!("{} cell IDs", cell_ids.len()),
            });
        }

        if counts.values().iter().any(|&x| x < 0.0 || !x.is_finite()) {
            return Err(MementoError::InvalidCountMatrix {
                reason: "Counts must be non-negative finite values".to_string(),
            });
        }

        if counts.values().iter().any(|&x| x != x.round()) {
            log::warn!(
                "Some count values are not integers. The noise models assume integer UMI counts."
            );
        }

        // Explicit zeros would otherwise count as distinct support points
        let counts = if counts.values().iter().any(|&x| x == 0.0) {
            let columns = (0..n_genes)
                .map(|j| {
                    let col = counts.col(j);
                    col.row_indices()
                        .iter()
                        .copied()
                        .zip(col.values().iter().copied())
                        .collect()
                })
                .collect();
            csc_from_columns(n_cells, columns)?
        } else {
            counts
        };

        Ok(Self {
            counts,
            gene_ids: deduplicate_names(gene_ids),
            cell_ids,
        })
    }

    /// Create from a dense cells x genes array
    pub fn from_dense(dense: ArrayView2<f64>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        let (n_cells, n_genes) = dense.dim();
        let mut coo = CooMatrix::new(n_cells, n_genes);
        for ((i, j), &value) in dense.indexed_iter() {
            if value != 0.0 {
                coo.push(i, j, value);
            }
        }
        Self::new(CscMatrix::from(&coo), gene_ids, cell_ids)
    }

    /// Number of genes (columns)
    pub fn n_genes(&self) -> usize {
        self.counts.ncols()
    }

    /// Number of cells (rows)
    pub fn n_cells(&self) -> usize {
        self.counts.nrows()
    }

    /// The underlying sparse matrix
    pub fn counts(&self) -> &CscMatrix<f64> {
        &self.counts
    }

    /// Gene IDs
    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    /// Cell IDs
    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    /// Non-zero entries of one gene as (cell rows, values)
    pub fn gene_column(&self, gene_idx: usize) -> (&[usize], &[f64]) {
        let offsets = self.counts.col_offsets();
        let (start, end) = (offsets[gene_idx], offsets[gene_idx + 1]);
        (&self.counts.row_indices()[start..end], &self.counts.values()[start..end])
    }

    /// Get gene index by ID
    pub fn gene_index(&self, gene_id: &str) -> Option<usize> {
        self.gene_ids.iter().position(|id| id == gene_id)
    }

    /// Total counts per cell, optionally restricted to genes where `gene_mask` is true
    pub fn cell_totals(&self, gene_mask: Option<&[bool]>) -> Vec<f64> {
        let mut totals = vec![0.0; self.n_cells()];
        for j in 0..self.n_genes() {
            if let Some(mask) = gene_mask {
                if !mask[j] {
                    continue;
                }
            }
            let (rows, values) = self.gene_column(j);
            for (&row, &value) in rows.iter().zip(values) {
                totals[row] += value;
            }
        }
        totals
    }

    /// Observed (un-normalized) mean count per gene
    pub fn gene_means(&self) -> Vec<f64> {
        let n = self.n_cells().max(1) as f64;
        (0..self.n_genes())
            .map(|j| self.gene_column(j).1.iter().sum::<f64>() / n)
            .collect()
    }

    /// Subset to specific cells, preserving the order given
    pub fn subset_cells(&self, cell_indices: &[usize]) -> Result<Self> {
        let mut new_row: Vec<Option<usize>> = vec![None; self.n_cells()];
        for (new_idx, &old_idx) in cell_indices.iter().enumerate() {
            if old_idx >= self.n_cells() {
                return Err(MementoError::DimensionMismatch {
                    expected: format!("cell index < {}", self.n_cells()),
                    got: old_idx.to_string(),
                });
            }
            new_row[old_idx] = Some(new_idx);
        }

        let columns = (0..self.n_genes())
            .map(|j| {
                let (rows, values) = self.gene_column(j);
                rows.iter()
                    .zip(values)
                    .filter_map(|(&row, &value)| new_row[row].map(|r| (r, value)))
                    .collect()
            })
            .collect();

        Ok(Self {
            counts: csc_from_columns(cell_indices.len(), columns)?,
            gene_ids: self.gene_ids.clone(),
            cell_ids: cell_indices.iter().map(|&i| self.cell_ids[i].clone()).collect(),
        })
    }

    /// Subset to specific genes (columns)
    pub fn subset_genes(&self, gene_indices: &[usize]) -> Result<Self> {
        let columns = gene_indices
            .iter()
            .map(|&j| {
                let (rows, values) = self.gene_column(j);
                rows.iter().copied().zip(values.iter().copied()).collect()
            })
            .collect();

        Ok(Self {
            counts: csc_from_columns(self.n_cells(), columns)?,
            gene_ids: gene_indices.iter().map(|&j| self.gene_ids[j].clone()).collect(),
            cell_ids: self.cell_ids.clone(),
        })
    }
}
