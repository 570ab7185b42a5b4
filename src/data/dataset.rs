//! Dataset - counts plus per-cell metadata

use super::{CellMetadata, CountMatrix};
use crate::error::{MementoError, Result};

/// An annotated single-cell dataset
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Raw counts (cells x genes)
    counts: CountMatrix,
    /// Per-cell metadata
    metadata: CellMetadata,
}

impl Dataset {
    /// Create a new dataset, checking that counts and metadata describe the same cells
    pub fn new(counts: CountMatrix, metadata: CellMetadata) -> Result<Self> {
        if counts.n_cells() != metadata.n_cells() {
            return Err(MementoError::DimensionMismatch {
                expected: format!("{} cells in metadata", counts.n_cells()),
                got: format!("{} cells", metadata.n_cells()),
            });
        }

        if counts.cell_ids() != metadata.cell_ids() {
            return Err(MementoError::InvalidMetadata {
                reason: "Cell IDs in counts and metadata do not match".to_string(),
            });
        }

        if counts.n_genes() == 0 {
            return Err(MementoError::EmptyData {
                reason: "Count matrix has no genes".to_string(),
            });
        }

        Ok(Self { counts, metadata })
    }

    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    pub fn metadata(&self) -> &CellMetadata {
        &self.metadata
    }

    pub fn n_cells(&self) -> usize {
        self.counts.n_cells()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.n_genes()
    }

    /// Map gene names to column indices
    pub fn resolve_gene_indices(&self, gene_names: &[String]) -> Result<Vec<usize>> {
        resolve_gene_indices(self.counts.gene_ids(), gene_names)
    }
}

/// Map gene names to their positions in `gene_ids`; unknown names are a caller error
pub fn resolve_gene_indices(gene_ids: &[String], gene_names: &[String]) -> Result<Vec<usize>> {
    let lookup: std::collections::HashMap<&str, usize> = gene_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    gene_names
        .iter()
        .map(|name| {
            lookup
                .get(name.as_str())
                .copied()
                .ok_or_else(|| MementoError::config(format!("Gene '{}' not found", name)))
        })
        .collect()
}
