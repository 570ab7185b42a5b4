//! Compression of gene columns into a weighted support
//!
//! Cells are grouped by their exact expression value(s) and the bin of their
//! approximate size factor. The support size is bounded by the number of
//! distinct expression patterns times the number of size factor bins, so the
//! cost of each bootstrap replicate no longer depends on the cell count.

use std::collections::BTreeMap;

use crate::moments::{MomentEstimator, WeightedSupport};
use crate::normalization::SizeFactorBins;

use ndarray::ArrayView2;

/// Sparse gene column as (sorted cell rows, non-zero values)
pub type SparseColumn<'a> = (&'a [usize], &'a [f64]);

/// Unique (expression, size factor bin) combinations and their cell counts
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSupport {
    /// Expression of the first gene at each support point
    pub values_1: Vec<f64>,
    /// Expression of the second gene (all zero for 1D supports)
    pub values_2: Vec<f64>,
    pub inv_sf: Vec<f64>,
    pub inv_sf_sq: Vec<f64>,
    /// Number of cells at each support point
    pub counts: Vec<f64>,
    pub n_cells: usize,
}

impl CompressedSupport {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Attach replicate weights (support points x replicates)
    pub fn weighted<'a>(&'a self, weights: ArrayView2<'a, f64>, n_obs: f64) -> WeightedSupport<'a> {
        WeightedSupport {
            inv_sf: &self.inv_sf,
            inv_sf_sq: &self.inv_sf_sq,
            weights,
            n_obs,
        }
    }
}

/// Number of distinct values in a sparse column, counting the implicit zero
pub fn distinct_values(column: SparseColumn<'_>, n_cells: usize) -> usize {
    let mut bits: Vec<u64> = column.1.iter().map(|v| v.to_bits()).collect();
    bits.sort_unstable();
    bits.dedup();
    bits.len() + usize::from(column.1.len() < n_cells)
}

/// Compress one or two gene columns against binned size factors
///
/// Returns `None` when any participating gene takes fewer than two distinct
/// values, since no resampling of it is informative.
pub fn compress(
    col_1: SparseColumn<'_>,
    col_2: Option<SparseColumn<'_>>,
    bins: &SizeFactorBins,
    estimator: &MomentEstimator,
) -> Option<CompressedSupport> {
    let n_cells = bins.assignment.len();
    if distinct_values(col_1, n_cells) < 2 {
        return None;
    }
    if let Some(col) = col_2 {
        if distinct_values(col, n_cells) < 2 {
            return None;
        }
    }

    let n_bins = bins.values.len();
    let mut bin_total = vec![0usize; n_bins];
    for &b in &bins.assignment {
        bin_total[b] += 1;
    }

    let mut table: BTreeMap<(u64, u64, usize), usize> = BTreeMap::new();
    let mut nonzero_in_bin = vec![0usize; n_bins];
    let mut record = |row: usize, v1: f64, v2: f64| {
        let bin = bins.assignment[row];
        nonzero_in_bin[bin] += 1;
        *table.entry((v1.to_bits(), v2.to_bits(), bin)).or_insert(0) += 1;
    };

    // Walk the union of non-zero rows of both columns
    let (rows_1, values_1) = col_1;
    let (rows_2, values_2): (&[usize], &[f64]) = col_2.unwrap_or((&[], &[]));
    let (mut i, mut j) = (0, 0);
    while i < rows_1.len() || j < rows_2.len() {
        let next_1 = rows_1.get(i).copied().unwrap_or(usize::MAX);
        let next_2 = rows_2.get(j).copied().unwrap_or(usize::MAX);
        match next_1.cmp(&next_2) {
            std::cmp::Ordering::Less => {
                record(next_1, values_1[i], 0.0);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                record(next_2, 0.0, values_2[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                record(next_1, values_1[i], values_2[j]);
                i += 1;
                j += 1;
            }
        }
    }

    for (bin, (&total, &nonzero)) in bin_total.iter().zip(&nonzero_in_bin).enumerate() {
        if total > nonzero {
            table.insert((0.0f64.to_bits(), 0.0f64.to_bits(), bin), total - nonzero);
        }
    }

    let mut support = CompressedSupport {
        values_1: Vec::with_capacity(table.len()),
        values_2: Vec::with_capacity(table.len()),
        inv_sf: Vec::with_capacity(table.len()),
        inv_sf_sq: Vec::with_capacity(table.len()),
        counts: Vec::with_capacity(table.len()),
        n_cells,
    };
    for ((v1, v2, bin), count) in table {
        let w = estimator.cell_weight(bins.values[bin]);
        support.values_1.push(f64::from_bits(v1));
        support.values_2.push(f64::from_bits(v2));
        support.inv_sf.push(w);
        support.inv_sf_sq.push(w * w);
        support.counts.push(count as f64);
    }
    Some(support)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moments::NoiseModel;
    use crate::normalization::{bin_size_factors, BinStatistic};

    #[test]
    fn test_distinct_values_counts_implicit_zero() {
        assert_eq!(distinct_values((&[0, 2], &[3.0, 3.0]), 4), 2);
        assert_eq!(distinct_values((&[0, 1], &[3.0, 3.0]), 2), 1);
        assert_eq!(distinct_values((&[], &[]), 5), 1);
    }

    #[test]
    fn test_compress_single_gene() {
        // 6 cells, two size factor bins
        let sf = [1.0, 1.0, 1.0, 3.0, 3.0, 3.0];
        let bins = bin_size_factors(&sf, 2, BinStatistic::Median);
        let est = MomentEstimator::new(NoiseModel::PoissonRelative, 0.0);
        let support = compress((&[0, 1, 3], &[2.0, 2.0, 5.0]), None, &bins, &est).unwrap();

        // (0, bin0) x1, (0, bin1) x2, (2, bin0) x2, (5, bin1) x1
        assert_eq!(support.len(), 4);
        assert_eq!(support.counts.iter().sum::<f64>(), 6.0);
        assert_eq!(support.values_1, vec![0.0, 0.0, 2.0, 5.0]);
        assert_eq!(support.counts, vec![1.0, 2.0, 2.0, 1.0]);
        assert!((support.inv_sf[1] - 1.0 / 3.0).abs() < 1e-12);
        assert!((support.inv_sf_sq[3] - 1.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_compress_pair_and_degenerate() {
        let bins = bin_size_factors(&[1.0; 4], 1, BinStatistic::Median);
        let est = MomentEstimator::new(NoiseModel::PoissonAbsolute, 0.0);

        let support = compress((&[0, 1], &[1.0, 2.0]), Some((&[1, 2], &[4.0, 4.0])), &bins, &est).unwrap();
        // patterns (0,0), (0,4), (1,0), (2,4)
        assert_eq!(support.len(), 4);
        assert_eq!(support.values_2, vec![0.0, 4.0, 0.0, 4.0]);
        assert!(support.inv_sf.iter().all(|&w| w == 1.0));

        assert!(compress((&[0, 1, 2, 3], &[2.0; 4]), None, &bins, &est).is_none());
        assert!(compress((&[0], &[1.0]), Some((&[], &[])), &bins, &est).is_none());
    }
}
