//! Input/Output for count matrices, metadata and result tables

mod csv;
mod results;

pub use self::csv::{read_count_matrix, read_gene_pairs, read_metadata, write_table, OutputFormat};
pub use results::{OneDResult, TestSummary, TwoDResult};
