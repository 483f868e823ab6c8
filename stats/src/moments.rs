/// Mean and unbiased variance (ddof = 1) of a sample. Returns `(NaN, NaN)`
/// for an empty sample and a variance of 0 for a single value.
pub fn mean_var(values: impl IntoIterator<Item = f64>) -> (f64, f64) {
    // Welford
    let mut n = 0usize;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for x in values {
        n += 1;
        let delta = x - mean;
        mean += delta / n as f64;
        m2 += delta * (x - mean);
    }
    match n {
        0 => (f64::NAN, f64::NAN),
        1 => (mean, 0.0),
        _ => (mean, m2 / (n - 1) as f64),
    }
}

/// Median of a sample, `None` if it is empty. NaNs sort last.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}
