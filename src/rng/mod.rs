//! Per-task random number generation and resampling weight draws
//!
//! Every gene or gene pair is tested in its own rayon task. Each task derives
//! its generator from the run seed and its task index through a SplitMix64
//! finalizer, so replicate draws are reproducible, independent across tasks and
//! unaffected by scheduling order.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution, Gamma};

use crate::error::{MementoError, Result};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// SplitMix64 output function
fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for one task, mixed from the run seed and the task index
pub fn task_seed(base_seed: u64, task: u64) -> u64 {
    splitmix64(base_seed.wrapping_add(GOLDEN_GAMMA.wrapping_mul(task.wrapping_add(1))))
}

/// Generator for one task (and optionally one sub-stream, e.g. a group)
pub fn task_rng(base_seed: u64, task: u64, stream: u64) -> StdRng {
    StdRng::seed_from_u64(task_seed(task_seed(base_seed, task), stream))
}

/// Dirichlet(counts) draws, one column per replicate; every column sums to 1
///
/// Support points with a non-positive count get weight 0.
pub fn dirichlet_draws<R: rand::Rng + ?Sized>(rng: &mut R, counts: &[f64], num_boot: usize) -> Result<Array2<f64>> {
    let gammas = counts
        .iter()
        .map(|&c| {
            if c > 0.0 {
                Gamma::new(c, 1.0).map(Some).map_err(|e| MementoError::NumericalInstability {
                    operation: "dirichlet resampling".to_string(),
                    details: e.to_string(),
                })
            } else {
                Ok(None)
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let mut weights = Array2::zeros((counts.len(), num_boot));
    for mut column in weights.columns_mut() {
        let mut total = 0.0;
        for (w, gamma) in column.iter_mut().zip(&gammas) {
            if let Some(g) = gamma {
                *w = g.sample(rng);
                total += *w;
            }
        }
        if total > 0.0 {
            column.mapv_inplace(|w| w / total);
        }
    }
    Ok(weights)
}

/// Multinomial(sum(counts), counts / sum(counts)) draws, one column per replicate
///
/// Drawn as a chain of conditional binomials, so each column sums exactly to
/// the original total.
pub fn multinomial_draws<R: rand::Rng + ?Sized>(rng: &mut R, counts: &[f64], num_boot: usize) -> Result<Array2<f64>> {
    let total: f64 = counts.iter().filter(|&&c| c > 0.0).sum();
    let n_total = total.round() as u64;

    let mut weights = Array2::zeros((counts.len(), num_boot));
    for mut column in weights.columns_mut() {
        let mut remaining_n = n_total;
        let mut remaining_mass = total;
        for (w, &c) in column.iter_mut().zip(counts) {
            if remaining_n == 0 || c <= 0.0 {
                continue;
            }
            let p = (c / remaining_mass).clamp(0.0, 1.0);
            let draw = Binomial::new(remaining_n, p)
                .map_err(|e| MementoError::NumericalInstability {
                    operation: "multinomial resampling".to_string(),
                    details: e.to_string(),
                })?
                .sample(rng);
            *w = draw as f64;
            remaining_n -= draw;
            remaining_mass -= c;
        }
    }
    Ok(weights)
}
