//! Small statistical helpers shared across modules

/// Sample quantile with linear interpolation between order statistics
/// (type 7 in Hyndman & Fan). `sorted_x` must be sorted ascending.
pub fn quantile_type7(sorted_x: &[f64], p: f64) -> f64 {
    let n = sorted_x.len();
    if n == 0 {
        return f64::NAN;
    }
    if n == 1 {
        return sorted_x[0];
    }

    let h = (n as f64 - 1.0) * p.clamp(0.0, 1.0);
    let lo = (h.floor() as usize).min(n - 1);
    let hi = (h.ceil() as usize).min(n - 1);

    if lo == hi {
        sorted_x[lo]
    } else {
        let frac = h - lo as f64;
        sorted_x[lo] + frac * (sorted_x[hi] - sorted_x[lo])
    }
}

/// Mean over the finite entries; NaN when there are none
pub fn nan_mean(x: &[f64]) -> f64 {
    let (sum, n) = x
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), &v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// Weighted mean over entries where both value and weight are finite
pub fn weighted_nan_mean(x: &[f64], weights: &[f64]) -> f64 {
    let (num, den) = x
        .iter()
        .zip(weights)
        .filter(|(v, w)| v.is_finite() && w.is_finite())
        .fold((0.0, 0.0), |(num, den), (&v, &w)| (num + v * w, den + w));
    if den > 0.0 {
        num / den
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_type7() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile_type7(&x, 0.5), 3.0);
        assert!((quantile_type7(&x, 0.1) - 1.4).abs() < 1e-12);
        assert_eq!(quantile_type7(&x, 1.0), 5.0);
        assert!(quantile_type7(&[], 0.5).is_nan());
    }

    #[test]
    fn test_nan_means() {
        assert_eq!(nan_mean(&[1.0, f64::NAN, 3.0]), 2.0);
        assert!(nan_mean(&[f64::NAN]).is_nan());
        assert_eq!(weighted_nan_mean(&[1.0, 3.0, f64::INFINITY], &[3.0, 1.0, 5.0]), 1.5);
    }
}
