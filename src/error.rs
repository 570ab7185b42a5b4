//! Error types for rust_memento

use thiserror::Error;

/// Main error type for moment estimation and hypothesis testing
#[derive(Error, Debug)]
pub enum MementoError {
    #[error("Invalid count matrix: {reason}")]
    InvalidCountMatrix { reason: String },

    #[error("Invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Numerical instability in {operation}: {details}")]
    NumericalInstability { operation: String, details: String },

    #[error("Trend fitting failed: {reason}")]
    TrendFittingFailed { reason: String },

    #[error("Tail fit failed: {reason}")]
    TailFitFailed { reason: String },

    #[error("Singular design: {reason}")]
    SingularDesign { reason: String },

    #[error("Empty data: {reason}")]
    EmptyData { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl MementoError {
    /// Shorthand for a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        MementoError::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether this error stems from a caller mistake rather than a data property
    pub fn is_configuration(&self) -> bool {
        matches!(self, MementoError::Configuration { .. })
    }
}

/// Result type alias for rust_memento operations
pub type Result<T> = std::result::Result<T, MementoError>;
