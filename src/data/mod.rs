//! Data structures for single-cell moment estimation

mod count_matrix;
mod dataset;
mod group_store;
mod metadata;

pub use count_matrix::CountMatrix;
pub use dataset::{resolve_gene_indices, Dataset};
pub use group_store::{group_key, Group, GroupSlice, GroupStore, DEFAULT_SF_BINS, GROUP_DELIMITER, GROUP_PREFIX};
pub use metadata::CellMetadata;
