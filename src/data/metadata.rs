//! Per-cell metadata

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{MementoError, Result};

/// Cell metadata containing categorical labels and numeric columns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellMetadata {
    /// Cell identifiers
    cell_ids: Vec<String>,
    /// Categorical columns (column name -> value per cell)
    conditions: HashMap<String, Vec<String>>,
    /// Numeric columns (column name -> value per cell)
    continuous: HashMap<String, Vec<f64>>,
}

impl CellMetadata {
    /// Create new cell metadata
    pub fn new(cell_ids: Vec<String>) -> Self {
        {
            let mut seen = std::collections::HashSet::new();
            for id in &cell_ids {
                if !seen.insert(id) {
                    log::warn!("Duplicate cell ID detected: '{}'. Cell IDs should be unique.", id);
                }
            }
        }
        Self {
            cell_ids,
            conditions: HashMap::new(),
            continuous: HashMap::new(),
        }
    }

    /// Add a categorical column
    pub fn add_condition(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        if values.len() != self.cell_ids.len() {
            return Err(MementoError::DimensionMismatch {
                expected: format!("{} values", self.cell_ids.len()),
                got: format!("{} values", values.len()),
            });
        }
        self.conditions.insert(name.to_string(), values);
        Ok(())
    }

    /// Add a numeric column
    pub fn add_continuous(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        if values.len() != self.cell_ids.len() {
            return Err(MementoError::DimensionMismatch {
                expected: format!("{} values", self.cell_ids.len()),
                got: format!("{} values", values.len()),
            });
        }
        self.continuous.insert(name.to_string(), values);
        Ok(())
    }

    /// Check if a categorical column exists
    pub fn has_condition(&self, name: &str) -> bool {
        self.conditions.contains_key(name)
    }

    /// Check if a numeric column exists
    pub fn has_continuous(&self, name: &str) -> bool {
        self.continuous.contains_key(name)
    }

    /// Get categorical values for a column
    pub fn condition(&self, name: &str) -> Option<&Vec<String>> {
        self.conditions.get(name)
    }

    /// Get numeric values for a column
    pub fn continuous(&self, name: &str) -> Option<&Vec<f64>> {
        self.continuous.get(name)
    }

    /// Get unique levels for a categorical column (sorted)
    pub fn levels(&self, name: &str) -> Option<Vec<String>> {
        self.conditions.get(name).map(|values| {
            let mut unique: Vec<String> = values.to_vec();
            unique.sort();
            unique.dedup();
            unique
        })
    }

    /// Cell IDs
    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    /// Number of cells
    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    /// Names of the categorical columns
    pub fn condition_names(&self) -> Vec<&str> {
        self.conditions.keys().map(|s| s.as_str()).collect()
    }
}
