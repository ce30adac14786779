// Copyright (c) Facebook, Inc. and its affiliates.
use super::influx::Sample;

/// Quantile of already sorted values with linear interpolation between the
/// two closest ranks. NaN for an empty slice.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => return std::f64::NAN,
        1 => return sorted[0],
        _ => {}
    }
    let pos = q.max(0.0).min(1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Returns `[Q1 - k*IQR, Q3 + k*IQR]` of the finite values.
pub fn iqr_bounds(vals: &[f64], k: f64) -> Option<(f64, f64)> {
    let mut sorted: Vec<f64> = vals.iter().cloned().filter(|v| v.is_finite()).collect();
    if sorted.len() == 0 {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    Some((q1 - k * iqr, q3 + k * iqr))
}

/// Drops samples outside the IQR fence of the column. Order is preserved.
pub fn remove_outliers(samples: Vec<Sample>, k: f64) -> Vec<Sample> {
    let vals: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let (lo, hi) = match iqr_bounds(&vals, k) {
        Some(v) => v,
        None => return vec![],
    };
    samples
        .into_iter()
        .filter(|s| s.value >= lo && s.value <= hi)
        .collect()
}
