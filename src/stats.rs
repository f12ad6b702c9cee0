// src/stats.rs
//
// Small robust-statistics helpers shared by the extractors. All functions
// return a neutral value (0.0 / None) on empty input instead of NaN.

use std::cmp::Ordering;

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    v
}

/// Percentile with linear interpolation between closest ranks, `q` in [0, 100].
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    let v = sorted(values);
    percentile_sorted(&v, q)
}

fn percentile_sorted(v: &[f64], q: f64) -> Option<f64> {
    if v.is_empty() {
        return None;
    }
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (v.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(v[lo] + (v[hi] - v[lo]) * frac)
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

pub fn median_f32(values: &[f32]) -> Option<f32> {
    let as_f64: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    median(&as_f64).map(|m| m as f32)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Tukey fences `[q1 - k*iqr, q3 + k*iqr]`.
pub fn iqr_bounds(values: &[f64], k: f64) -> Option<(f64, f64)> {
    let v = sorted(values);
    let q1 = percentile_sorted(&v, 25.0)?;
    let q3 = percentile_sorted(&v, 75.0)?;
    let iqr = q3 - q1;
    Some((q1 - k * iqr, q3 + k * iqr))
}

/// Weighted mean; falls back to the plain mean when all weights are zero.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> Option<f64> {
    if values.is_empty() || values.len() != weights.len() {
        return None;
    }
    let total: f64 = weights.iter().sum();
    if total <= f64::EPSILON {
        return mean(values);
    }
    Some(values.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total)
}

/// Least-squares slope of `ys` against `xs`. None with fewer than two
/// points or a degenerate x spread.
pub fn linear_slope(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() < 2 || xs.len() != ys.len() {
        return None;
    }
    let mx = mean(xs)?;
    let my = mean(ys)?;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        sxx += (x - mx) * (x - mx);
        sxy += (x - mx) * (y - my);
    }
    if sxx <= 1e-12 {
        return None;
    }
    Some(sxy / sxx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        assert_eq!(percentile(&v, 100.0), Some(4.0));
        assert!((percentile(&v, 75.0).unwrap() - 3.25).abs() < 1e-9);
        assert!((median(&v).unwrap() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_inputs_are_neutral() {
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(mean(&[]), None);
        assert_eq!(iqr_bounds(&[], 1.5), None);
        assert_eq!(linear_slope(&[1.0], &[2.0]), None);
    }

    #[test]
    fn test_iqr_bounds() {
        let v = [10.0, 11.0, 12.0, 13.0, 100.0];
        let (lo, hi) = iqr_bounds(&v, 1.5).unwrap();
        assert!(lo < 10.0);
        assert!(hi < 100.0);
    }

    #[test]
    fn test_weighted_mean_zero_weights() {
        assert_eq!(weighted_mean(&[2.0, 4.0], &[0.0, 0.0]), Some(3.0));
        assert_eq!(weighted_mean(&[2.0, 4.0], &[1.0, 3.0]), Some(3.5));
    }

    #[test]
    fn test_linear_slope() {
        let t = [0.0, 1.0, 2.0, 3.0];
        let d = [20.0, 18.0, 16.0, 14.0];
        assert!((linear_slope(&t, &d).unwrap() + 2.0).abs() < 1e-9);
        assert_eq!(linear_slope(&[1.0, 1.0], &[0.0, 5.0]), None);
    }
}
