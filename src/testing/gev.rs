//! Generalized extreme value distribution: density, tail probabilities,
//! maximum likelihood fitting and a Kolmogorov-Smirnov goodness-of-fit test.
//!
//! Parametrized by shape `xi`, location `mu` and scale `sigma` with
//! `F(x) = exp(-(1 + xi z)^(-1/xi))`, `z = (x - mu) / sigma`. `xi = 0` is the
//! Gumbel limit.

use statrs::statistics::Statistics;

use crate::error::{MementoError, Result};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// |xi| below this is treated as the Gumbel case
const GUMBEL_EPS: f64 = 1e-8;

const MAX_ITER: usize = 2000;
const F_TOL: f64 = 1e-10;

/// Fitted GEV parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GevParams {
    pub shape: f64,
    pub location: f64,
    pub scale: f64,
}

impl GevParams {
    /// `(1 + xi z)^(-1/xi)`, or None outside the support
    fn tail_term(&self, x: f64) -> Option<f64> {
        let z = (x - self.location) / self.scale;
        if self.shape.abs() < GUMBEL_EPS {
            return Some((-z).exp());
        }
        let t = 1.0 + self.shape * z;
        if t > 0.0 {
            Some(t.powf(-1.0 / self.shape))
        } else {
            None
        }
    }

    pub fn log_pdf(&self, x: f64) -> f64 {
        if !(self.scale > 0.0) {
            return f64::NEG_INFINITY;
        }
        let z = (x - self.location) / self.scale;
        if self.shape.abs() < GUMBEL_EPS {
            return -self.scale.ln() - z - (-z).exp();
        }
        let t = 1.0 + self.shape * z;
        if t <= 0.0 {
            return f64::NEG_INFINITY;
        }
        -self.scale.ln() - (1.0 + 1.0 / self.shape) * t.ln() - t.powf(-1.0 / self.shape)
    }

    pub fn cdf(&self, x: f64) -> f64 {
        match self.tail_term(x) {
            Some(term) => (-term).exp(),
            // Below the lower bound (xi > 0) or above the upper bound (xi < 0)
            None if self.shape > 0.0 => 0.0,
            None => 1.0,
        }
    }

    /// Survival function 1 - F(x), accurate in the far upper tail
    pub fn sf(&self, x: f64) -> f64 {
        match self.tail_term(x) {
            Some(term) => -(-term).exp_m1(),
            None if self.shape > 0.0 => 1.0,
            None => 0.0,
        }
    }

    pub fn neg_log_likelihood(&self, data: &[f64]) -> f64 {
        let ll: f64 = data.iter().map(|&x| self.log_pdf(x)).sum();
        if ll.is_finite() {
            -ll
        } else {
            f64::INFINITY
        }
    }
}

/// Maximum likelihood fit by Nelder-Mead over (xi, mu, log sigma)
///
/// Starts from the Gumbel method-of-moments estimate.
pub fn fit_gev(data: &[f64]) -> Result<GevParams> {
    if data.len() < 3 || data.iter().any(|x| !x.is_finite()) {
        return Err(MementoError::TailFitFailed {
            reason: format!("{} observations (finite required)", data.len()),
        });
    }

    let mean = data.iter().mean();
    let sd = data.iter().std_dev();
    if !(sd > 0.0) {
        return Err(MementoError::TailFitFailed {
            reason: "tail observations are constant".to_string(),
        });
    }

    let scale0 = sd * 6.0f64.sqrt() / std::f64::consts::PI;
    let start = [0.0, mean - EULER_GAMMA * scale0, scale0.ln()];
    let steps = [0.1, 0.1 * scale0, 0.1];

    let objective = |p: &[f64; 3]| {
        GevParams {
            shape: p[0],
            location: p[1],
            scale: p[2].exp(),
        }
        .neg_log_likelihood(data)
    };

    let best = nelder_mead(objective, start, steps);
    let params = GevParams {
        shape: best[0],
        location: best[1],
        scale: best[2].exp(),
    };

    let nll = params.neg_log_likelihood(data);
    if !nll.is_finite() || !params.scale.is_finite() {
        return Err(MementoError::TailFitFailed {
            reason: "likelihood did not converge to a finite optimum".to_string(),
        });
    }
    Ok(params)
}

/// Minimize a function of three parameters with the Nelder-Mead simplex method
fn nelder_mead<F: Fn(&[f64; 3]) -> f64>(f: F, start: [f64; 3], steps: [f64; 3]) -> [f64; 3] {
    const ALPHA: f64 = 1.0;
    const GAMMA: f64 = 2.0;
    const RHO: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let mut simplex: Vec<([f64; 3], f64)> = Vec::with_capacity(4);
    simplex.push((start, f(&start)));
    for k in 0..3 {
        let mut vertex = start;
        vertex[k] += steps[k];
        simplex.push((vertex, f(&vertex)));
    }

    for _ in 0..MAX_ITER {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let (best, worst) = (simplex[0].1, simplex[3].1);
        if worst.is_finite() && (worst - best).abs() <= F_TOL * (1.0 + best.abs()) {
            break;
        }

        let mut centroid = [0.0; 3];
        for (vertex, _) in &simplex[..3] {
            for k in 0..3 {
                centroid[k] += vertex[k] / 3.0;
            }
        }
        let along = |t: f64| -> [f64; 3] {
            let w = simplex[3].0;
            [
                centroid[0] + t * (w[0] - centroid[0]),
                centroid[1] + t * (w[1] - centroid[1]),
                centroid[2] + t * (w[2] - centroid[2]),
            ]
        };

        let reflected = along(-ALPHA);
        let f_reflected = f(&reflected);

        if f_reflected < simplex[0].1 {
            let expanded = along(-GAMMA);
            let f_expanded = f(&expanded);
            simplex[3] = if f_expanded < f_reflected {
                (expanded, f_expanded)
            } else {
                (reflected, f_reflected)
            };
        } else if f_reflected < simplex[2].1 {
            simplex[3] = (reflected, f_reflected);
        } else {
            let contracted = if f_reflected < simplex[3].1 {
                along(-RHO)
            } else {
                along(RHO)
            };
            let f_contracted = f(&contracted);
            if f_contracted < simplex[3].1.min(f_reflected) {
                simplex[3] = (contracted, f_contracted);
            } else {
                let anchor = simplex[0].0;
                for entry in simplex.iter_mut().skip(1) {
                    let mut v = entry.0;
                    for k in 0..3 {
                        v[k] = anchor[k] + SIGMA * (v[k] - anchor[k]);
                    }
                    *entry = (v, f(&v));
                }
            }
        }
    }

    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    simplex[0].0
}

/// One-sample Kolmogorov-Smirnov test against a fitted GEV
///
/// Returns (D statistic, asymptotic p-value with Stephens' small-sample correction).
pub fn ks_test(data: &[f64], params: &GevParams) -> (f64, f64) {
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len() as f64;

    let d = sorted
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let f = params.cdf(x);
            ((i as f64 + 1.0) / n - f).max(f - i as f64 / n)
        })
        .fold(0.0, f64::max);

    let sqrt_n = n.sqrt();
    let lambda = (sqrt_n + 0.12 + 0.11 / sqrt_n) * d;
    (d, kolmogorov_sf(lambda))
}

/// Survival function of the Kolmogorov distribution
fn kolmogorov_sf(lambda: f64) -> f64 {
    if lambda < 0.2 {
        return 1.0;
    }
    let mut sum = 0.0;
    for k in 1..=100 {
        let kf = k as f64;
        let term = (-2.0 * kf * kf * lambda * lambda).exp();
        sum += if k % 2 == 1 { term } else { -term };
        if term < 1e-16 {
            break;
        }
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use statrs::distribution::{ContinuousCDF, Weibull};

    fn sample(params: &GevParams, n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let u: f64 = rng.gen_range(1e-12..1.0);
                let e = -u.ln();
                if params.shape.abs() < GUMBEL_EPS {
                    params.location - params.scale * e.ln()
                } else {
                    params.location + params.scale * (e.powf(-params.shape) - 1.0) / params.shape
                }
            })
            .collect()
    }

    #[test]
    fn test_gumbel_limit() {
        let g = GevParams { shape: 0.0, location: 0.0, scale: 1.0 };
        assert!((g.cdf(0.0) - (-1.0f64).exp()).abs() < 1e-12);
        assert!((g.sf(2.0) + g.cdf(2.0) - 1.0).abs() < 1e-12);
        assert!((g.log_pdf(0.0) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_shape_matches_reversed_weibull() {
        // X ~ GEV(xi < 0) has upper bound b and b - X ~ Weibull(-1/xi, sigma/|xi|)
        let g = GevParams { shape: -0.25, location: 1.0, scale: 2.0 };
        let bound = g.location - g.scale / g.shape;
        let weibull = Weibull::new(-1.0 / g.shape, g.scale / g.shape.abs()).unwrap();
        for &x in &[-3.0, 0.0, 1.0, 4.0, 8.5] {
            assert!((g.cdf(x) - weibull.sf(bound - x)).abs() < 1e-10);
        }
        assert_eq!(g.cdf(bound + 1.0), 1.0);
        assert_eq!(g.sf(bound + 1.0), 0.0);
    }

    #[test]
    fn test_support_bounds_positive_shape() {
        let g = GevParams { shape: 0.5, location: 0.0, scale: 1.0 };
        // lower bound at mu - sigma / xi = -2
        assert_eq!(g.cdf(-3.0), 0.0);
        assert_eq!(g.sf(-3.0), 1.0);
        assert_eq!(g.log_pdf(-3.0), f64::NEG_INFINITY);
    }

    #[test]
    fn test_fit_recovers_parameters() {
        let truth = GevParams { shape: 0.1, location: 2.0, scale: 0.5 };
        let data = sample(&truth, 3000, 17);
        let fit = fit_gev(&data).unwrap();
        assert!((fit.shape - truth.shape).abs() < 0.06);
        assert!((fit.location - truth.location).abs() < 0.05);
        assert!((fit.scale - truth.scale).abs() < 0.05);

        let (_, p) = ks_test(&data, &fit);
        assert!(p > 0.05);
    }

    #[test]
    fn test_ks_rejects_wrong_distribution() {
        let truth = GevParams { shape: 0.0, location: 0.0, scale: 1.0 };
        let data = sample(&truth, 500, 3);
        let shifted = GevParams { location: 1.5, ..truth };
        let (d, p) = ks_test(&data, &shifted);
        assert!(d > 0.2);
        assert!(p < 1e-6);
    }

    #[test]
    fn test_fit_rejects_degenerate_input() {
        assert!(fit_gev(&[1.0, 1.0, 1.0, 1.0]).is_err());
        assert!(fit_gev(&[1.0, 2.0]).is_err());
        assert!(fit_gev(&[1.0, f64::NAN, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_kolmogorov_tail() {
        assert_eq!(kolmogorov_sf(0.1), 1.0);
        // P(K > 1.36) is about 0.049
        assert!((kolmogorov_sf(1.36) - 0.0494).abs() < 1e-3);
    }
}
