/// Computes the arithmetic mean of a slice of values. Returns 0.0 for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Computes the population standard deviation given a pre-computed mean.
/// Returns 0.0 for empty input.
pub fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;

    variance.sqrt()
}

/// Pearson correlation of paired samples.
///
/// Returns `None` when there are fewer than two pairs or either series is
/// constant.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let (xs, ys) = (&xs[..n], &ys[..n]);
    let (mx, my) = (mean(xs), mean(ys));
    let (sx, sy) = (stddev(xs, mx), stddev(ys, my));
    if sx == 0.0 || sy == 0.0 {
        return None;
    }
    let covariance = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (x - mx) * (y - my))
        .sum::<f64>()
        / n as f64;
    Some(covariance / (sx * sy))
}

/// Percentage change from `before` to `after`; `None` when `before` is not positive.
pub fn pct_change(before: f64, after: f64) -> Option<f64> {
    if before > 0.0 {
        Some((after - before) / before * 100.0)
    } else {
        None
    }
}

/// `part` as a percentage of `whole`; 0.0 when `whole` is zero.
pub fn pct_of(part: f64, whole: f64) -> f64 {
    if whole == 0.0 { 0.0 } else { part / whole * 100.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_stddev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let m = mean(&values);
        assert_eq!(m, 5.0);
        assert_eq!(stddev(&values, m), 2.0);
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn test_pearson() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert!((pearson(&xs, &[2.0, 4.0, 6.0, 8.0]).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson(&xs, &[8.0, 6.0, 4.0, 2.0]).unwrap() + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&xs, &[3.0, 3.0, 3.0, 3.0]), None);
        assert_eq!(pearson(&[1.0], &[1.0]), None);
    }

    #[test]
    fn test_pct_change() {
        assert_eq!(pct_change(100.0, 80.0), Some(-20.0));
        assert_eq!(pct_change(0.0, 10.0), None);
        assert_eq!(pct_of(1.0, 4.0), 25.0);
        assert_eq!(pct_of(1.0, 0.0), 0.0);
    }
}
