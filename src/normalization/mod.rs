//! Size factor normalization for single-cell count data

mod size_factors;

pub use size_factors::{
    approximate_size_factors, bin_size_factors, compute_size_factors, estimate_size_factor, naive_size_factor, BinStatistic,
    SizeFactorBins, SizeFactorParams,
};
