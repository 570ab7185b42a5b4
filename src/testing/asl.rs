//! Achieved significance level from a bootstrap reference distribution

use super::gev::{fit_gev, ks_test};

/// Tail-approximation settings
#[derive(Debug, Clone)]
pub struct AslParams {
    /// Largest number of tail observations tried
    pub max_exceedances: usize,
    /// Decrement between attempts
    pub exceedance_step: usize,
    /// Attempts continue while the tail size exceeds this
    pub min_exceedances: usize,
    /// KS p-value a fit must exceed to be accepted
    pub gof_threshold: f64,
    /// Point at which the fitted survival function is evaluated
    pub eval_point: f64,
}

impl Default for AslParams {
    fn default() -> Self {
        Self {
            max_exceedances: 300,
            exceedance_step: 30,
            min_exceedances: 50,
            gof_threshold: 0.05,
            eval_point: 1.0,
        }
    }
}

/// Two-sided empirical ASL with add-one correction
pub fn empirical_asl(extreme_count: usize, n: usize) -> f64 {
    2.0 * (extreme_count as f64 + 1.0) / (n as f64 + 1.0)
}

/// ASL of a reference distribution of bootstrap coefficients
///
/// With more than two replicates on the minority side of zero the empirical
/// two-sided count is used as is. Otherwise a GEV is fitted to the tail of the
/// reference, oriented so the minority side is the upper tail, over a ladder of
/// shrinking tail sizes; the first fit passing the goodness-of-fit threshold
/// gives the ASL. Failed fits fall back to the empirical formula.
pub fn compute_asl(reference: &[f64], params: &AslParams) -> f64 {
    let n = reference.len();
    if n == 0 {
        return f64::NAN;
    }

    let positive = reference.iter().filter(|&&x| x > 0.0).count();
    let extreme_count = positive.min(n - positive);
    let empirical = empirical_asl(extreme_count, n);

    if extreme_count > 2 {
        return empirical;
    }

    match gev_tail_asl(reference, params) {
        Some(asl) => asl,
        None => empirical,
    }
}

fn gev_tail_asl(reference: &[f64], params: &AslParams) -> Option<f64> {
    let n = reference.len();
    let mean = reference.iter().sum::<f64>() / n as f64;

    let mut oriented: Vec<f64> = reference
        .iter()
        .map(|&x| if mean < 0.0 { x } else { -x })
        .filter(|x| x.is_finite())
        .collect();
    oriented.sort_by(|a, b| a.total_cmp(b));

    for tail_len in tail_sizes(oriented.len(), params) {
        let tail = &oriented[oriented.len() - tail_len..];

        let fit = match fit_gev(tail) {
            Ok(fit) => fit,
            Err(e) => {
                log::debug!("GEV tail fit failed ({}); using the empirical ASL", e);
                return None;
            }
        };

        let (_, ks_pval) = ks_test(tail, &fit);
        if ks_pval > params.gof_threshold {
            let asl = 2.0 * (tail_len as f64 / n as f64) * fit.sf(params.eval_point);
            if asl.is_finite() {
                return Some(asl);
            }
            log::debug!("GEV tail ASL is not finite; using the empirical ASL");
            return None;
        }
    }

    log::debug!("No GEV tail size passed the goodness-of-fit test; using the empirical ASL");
    None
}

/// Tail lengths tried for `n_finite` reference values, largest first
///
/// Rungs of the ladder that exceed the reference collapse into a single
/// attempt on the whole reference.
fn tail_sizes(n_finite: usize, params: &AslParams) -> Vec<usize> {
    let mut sizes: Vec<usize> = Vec::new();
    let mut n_exceed = params.max_exceedances;
    while n_exceed > params.min_exceedances {
        let tail_len = n_exceed.min(n_finite);
        if tail_len > 0 && sizes.last() != Some(&tail_len) {
            sizes.push(tail_len);
        }
        if params.exceedance_step == 0 {
            break;
        }
        n_exceed = n_exceed.saturating_sub(params.exceedance_step);
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_empirical_branch_is_exact() {
        // 10 positive, 30 non-positive -> extreme count 10
        let reference: Vec<f64> = (0..40).map(|i| if i < 10 { 1.0 } else { -1.0 - i as f64 }).collect();
        let asl = compute_asl(&reference, &AslParams::default());
        assert_eq!(asl, 2.0 * 11.0 / 41.0);
    }

    #[test]
    fn test_centered_reference_is_not_significant() {
        let mut rng = StdRng::seed_from_u64(1);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let reference: Vec<f64> = (0..2000).map(|_| normal.sample(&mut rng)).collect();
        let asl = compute_asl(&reference, &AslParams::default());
        assert!(asl > 0.5);
    }

    #[test]
    fn test_tail_fit_resolves_small_asl() {
        // All replicates far above zero: extreme count 0
        let mut rng = StdRng::seed_from_u64(2);
        let normal: Normal<f64> = Normal::new(4.0, 1.0).unwrap();
        let reference: Vec<f64> = (0..2000).map(|_| normal.sample(&mut rng).abs()).collect();
        let asl = compute_asl(&reference, &AslParams::default());
        assert!(asl.is_finite());
        assert!((0.0..0.05).contains(&asl));
    }

    #[test]
    fn test_tail_ladder() {
        let params = AslParams::default();
        assert_eq!(tail_sizes(2000, &params), vec![300, 270, 240, 210, 180, 150, 120, 90, 60]);
        // Rungs beyond a short reference are tried once on the whole reference
        assert_eq!(tail_sizes(200, &params), vec![200, 180, 150, 120, 90, 60]);
        assert_eq!(tail_sizes(40, &params), vec![40]);
        assert!(tail_sizes(0, &params).is_empty());

        let single = AslParams {
            exceedance_step: 0,
            ..AslParams::default()
        };
        assert_eq!(tail_sizes(2000, &single), vec![300]);
    }

    #[test]
    fn test_failed_fit_falls_back() {
        // Constant tail cannot be fitted
        let reference = vec![3.0; 500];
        let asl = compute_asl(&reference, &AslParams::default());
        assert_eq!(asl, empirical_asl(0, 500));

        // Too few observations to reach the ladder
        let short = vec![1.0, 2.0];
        assert_eq!(compute_asl(&short, &AslParams::default()), empirical_asl(0, 2));
        assert!(compute_asl(&[], &AslParams::default()).is_nan());
    }
}
