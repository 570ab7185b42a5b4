//! Design matrices and weighted least squares over groups

mod design;
mod regression;

pub use design::{build_design_matrix, DesignMatrix, Formula, Term};
pub use regression::WeightedLeastSquares;
