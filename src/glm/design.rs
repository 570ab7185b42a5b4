//! Group-level design matrices from model formulas
//!
//! Supported grammar: an optional leading `~`, terms separated by `+`, `1` for
//! the (implicit) intercept, `0` or `-1` to drop it, a bare grouping column for
//! a treatment-coded factor and `num(column)` for a numeric covariate.

use ndarray::Array2;

use crate::data::GroupStore;
use crate::error::{MementoError, Result};
use crate::glm::WeightedLeastSquares;

/// One parsed formula term
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Factor(String),
    Numeric(String),
}

/// A parsed formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    pub intercept: bool,
    pub terms: Vec<Term>,
}

impl Formula {
    pub fn parse(formula: &str) -> Result<Self> {
        let body = formula.trim();
        let body = body.strip_prefix('~').unwrap_or(body);

        let mut intercept = true;
        let mut terms = Vec::new();
        for raw in body.split('+') {
            let token = raw.trim();
            match token {
                "" => {
                    return Err(MementoError::config(format!("Empty term in formula '{}'", formula)));
                }
                "1" => intercept = true,
                "0" | "-1" => intercept = false,
                _ => {
                    // "x - 1" drops the intercept after a term
                    let (token, drop) = match token.strip_suffix("- 1").or_else(|| token.strip_suffix("-1")) {
                        Some(rest) => (rest.trim(), true),
                        None => (token, false),
                    };
                    if drop {
                        intercept = false;
                    }
                    terms.push(parse_term(token, formula)?);
                }
            }
        }
        Ok(Self { intercept, terms })
    }
}

fn parse_term(token: &str, formula: &str) -> Result<Term> {
    if let Some(inner) = token.strip_prefix("num(").and_then(|t| t.strip_suffix(')')) {
        let name = inner.trim();
        if name.is_empty() {
            return Err(MementoError::config(format!("Empty num() term in formula '{}'", formula)));
        }
        return Ok(Term::Numeric(name.to_string()));
    }
    if token.contains(|c: char| c.is_whitespace() || "()*:".contains(c)) {
        return Err(MementoError::config(format!(
            "Unsupported term '{}' in formula '{}'",
            token, formula
        )));
    }
    Ok(Term::Factor(token.to_string()))
}

/// Rows = groups, columns = encoded covariates
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub matrix: Array2<f64>,
    pub column_names: Vec<String>,
    /// Column holding the covariate of interest
    pub covariate_index: usize,
    /// Cell count per group
    pub weights: Vec<f64>,
    pub group_keys: Vec<String>,
}

impl DesignMatrix {
    pub fn n_groups(&self) -> usize {
        self.matrix.nrows()
    }

    /// Restrict to a subset of groups (rows)
    pub fn select_groups(&self, rows: &[usize]) -> DesignMatrix {
        DesignMatrix {
            matrix: self.matrix.select(ndarray::Axis(0), rows),
            column_names: self.column_names.clone(),
            covariate_index: self.covariate_index,
            weights: rows.iter().map(|&r| self.weights[r]).collect(),
            group_keys: rows.iter().map(|&r| self.group_keys[r].clone()).collect(),
        }
    }

    /// Whether the covariate column takes at least two distinct values
    pub fn covariate_varies(&self) -> bool {
        let column = self.matrix.column(self.covariate_index);
        column.iter().any(|&v| v != column[0])
    }
}

/// Build the design matrix over all groups of a store
///
/// `covariate` selects the first column whose name contains it; no match is a
/// configuration error.
pub fn build_design_matrix(store: &GroupStore, formula: &str, covariate: &str) -> Result<DesignMatrix> {
    let parsed = Formula::parse(formula)?;
    let groups = store.groups();
    let n_groups = groups.len();
    if n_groups == 0 {
        return Err(MementoError::EmptyData {
            reason: "No groups to build a design matrix from".to_string(),
        });
    }

    let mut columns: Vec<Vec<f64>> = Vec::new();
    let mut column_names: Vec<String> = Vec::new();

    if parsed.intercept {
        columns.push(vec![1.0; n_groups]);
        column_names.push("Intercept".to_string());
    }

    let mut full_coding = !parsed.intercept;
    for term in &parsed.terms {
        match term {
            Term::Factor(name) => {
                let idx = store.label_index(name)?;
                let values: Vec<&str> = groups.iter().map(|g| g.labels()[idx].as_str()).collect();
                let mut levels = values.clone();
                levels.sort_unstable();
                levels.dedup();

                let coded: &[&str] = if full_coding { &levels } else { &levels[1..] };
                for level in coded {
                    columns.push(values.iter().map(|v| f64::from(u8::from(v == level))).collect());
                    column_names.push(if full_coding {
                        format!("{}[{}]", name, level)
                    } else {
                        format!("{}[T.{}]", name, level)
                    });
                }
                full_coding = false;
            }
            Term::Numeric(name) => {
                let idx = store.label_index(name)?;
                let values = groups
                    .iter()
                    .map(|g| {
                        let label = &g.labels()[idx];
                        label.trim().parse::<f64>().map_err(|_| {
                            MementoError::config(format!("Value '{}' of column '{}' is not numeric", label, name))
                        })
                    })
                    .collect::<Result<Vec<f64>>>()?;
                columns.push(values);
                column_names.push(format!("num({})", name));
            }
        }
    }

    if columns.is_empty() {
        return Err(MementoError::config(format!("Formula '{}' has no columns", formula)));
    }

    let covariate_index = column_names
        .iter()
        .position(|c| c.contains(covariate))
        .ok_or_else(|| {
            MementoError::config(format!(
                "Covariate '{}' matches none of the design columns {:?}",
                covariate, column_names
            ))
        })?;

    let n_cols = columns.len();
    let matrix = Array2::from_shape_fn((n_groups, n_cols), |(i, j)| columns[j][i]);
    let weights: Vec<f64> = groups.iter().map(|g| g.cell_count() as f64).collect();

    if WeightedLeastSquares::new(matrix.view(), &weights).is_err() {
        log::warn!(
            "Design matrix for '{}' is not full rank over all {} groups",
            formula,
            n_groups
        );
    }
    log::debug!("Design columns: {:?}, covariate column {}", column_names, covariate_index);

    Ok(DesignMatrix {
        matrix,
        column_names,
        covariate_index,
        weights,
        group_keys: groups.iter().map(|g| g.key().to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CellMetadata, CountMatrix, Dataset};
    use crate::moments::NoiseModel;
    use ndarray::Array2;

    fn store() -> GroupStore {
        let n = 8;
        let cells: Vec<String> = (0..n).map(|i| format!("c{}", i)).collect();
        let dense = Array2::from_shape_fn((n, 2), |(i, j)| (i + j) as f64);
        let counts = CountMatrix::from_dense(dense.view(), vec!["A".into(), "B".into()], cells.clone()).unwrap();
        let mut meta = CellMetadata::new(cells);
        let stim = ["ctrl", "ctrl", "stim", "stim", "ctrl", "stim", "ctrl", "stim"];
        let ind = ["1", "1", "1", "1", "2", "2", "2", "2"];
        meta.add_condition("stim", stim.iter().map(|s| s.to_string()).collect())
            .unwrap();
        meta.add_condition("ind", ind.iter().map(|s| s.to_string()).collect()).unwrap();
        let ds = Dataset::new(counts, meta).unwrap();
        GroupStore::create(&ds, &["stim".to_string(), "ind".to_string()], None, NoiseModel::PoissonAbsolute).unwrap()
    }

    #[test]
    fn test_formula_parsing() {
        let f = Formula::parse("~ 1 + stim + num(dose)").unwrap();
        assert!(f.intercept);
        assert_eq!(f.terms, vec![Term::Factor("stim".into()), Term::Numeric("dose".into())]);

        let f = Formula::parse("0 + stim").unwrap();
        assert!(!f.intercept);
        assert!(!Formula::parse("stim - 1").unwrap().intercept);
        assert!(Formula::parse("stim + ").unwrap_err().is_configuration());
        assert!(Formula::parse("stim:ind").unwrap_err().is_configuration());
    }

    #[test]
    fn test_treatment_coding() {
        let store = store();
        // groups: ctrl^1, stim^1, ctrl^2, stim^2
        let design = build_design_matrix(&store, "1 + stim + ind", "stim").unwrap();
        assert_eq!(design.column_names, vec!["Intercept", "stim[T.stim]", "ind[T.2]"]);
        assert_eq!(design.covariate_index, 1);
        assert_eq!(design.matrix.column(1).to_vec(), vec![0.0, 1.0, 0.0, 1.0]);
        assert_eq!(design.matrix.column(2).to_vec(), vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(design.weights, vec![2.0, 2.0, 2.0, 2.0]);
        assert!(design.covariate_varies());
        assert!(!design.select_groups(&[1, 3]).covariate_varies());
    }

    #[test]
    fn test_full_coding_and_numeric() {
        let store = store();
        let design = build_design_matrix(&store, "0 + stim + num(ind)", "ind").unwrap();
        assert_eq!(design.column_names, vec!["stim[ctrl]", "stim[stim]", "num(ind)"]);
        assert_eq!(design.covariate_index, 2);
        assert_eq!(design.matrix.column(2).to_vec(), vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_configuration_errors() {
        let store = store();
        assert!(build_design_matrix(&store, "1 + batch", "batch").unwrap_err().is_configuration());
        assert!(build_design_matrix(&store, "1 + stim", "dose").unwrap_err().is_configuration());
        assert!(build_design_matrix(&store, "num(stim)", "stim").unwrap_err().is_configuration());
    }
}
