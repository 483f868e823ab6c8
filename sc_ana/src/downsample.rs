//! Density-aware down-sampling of cells

use crate::errors::DataError;
use crate::neighbors::knn;
use anyhow::Result;
use log::debug;
use ndarray::ArrayView2;
use sc_types::KnnGraph;
use stats::WeightedReservoirSampler;

// floor on the k-th neighbor distance so duplicate points keep a finite density
const MIN_DISTANCE: f64 = 1e-12;

/// Cells picked by [`down_sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct DownsampledSubset {
    /// Selected cell indices, ascending.
    pub indices: Vec<usize>,
    /// Sampling weight of each selected cell, normalized so the largest weight over all cells is 1.
    pub weights: Vec<f64>,
}

impl DownsampledSubset {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Membership mask over `n` cells.
    pub fn mask(&self, n: usize) -> Vec<bool> {
        let mut mask = vec![false; n];
        for &i in &self.indices {
            mask[i] = true;
        }
        mask
    }
}

/// Number of cells to keep: `round(fraction * n)` clamped to `[1, n]`.
pub fn target_size(n: usize, fraction: f64) -> usize {
    ((fraction * n as f64).round() as usize).clamp(1, n.max(1))
}

/// Sampling weight of every cell, proportional to `density^alpha` where the
/// density is the inverse distance to the farthest neighbor in `graph`.
pub fn density_weights(graph: &KnnGraph, alpha: f64) -> Vec<f64> {
    let last = graph.k().saturating_sub(1);
    let log_weights: Vec<f64> = (0..graph.n_cells())
        .map(|i| -alpha * graph.distances[[i, last]].max(MIN_DISTANCE).ln())
        .collect();
    let top = log_weights
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    log_weights.iter().map(|w| (w - top).exp()).collect()
}

/// Weighted sample without replacement of `target_size(n, fraction)` cells,
/// using an existing neighbor graph for the density estimate.
pub fn down_sample_with_knn(
    graph: &KnnGraph,
    fraction: f64,
    alpha: f64,
    seed: u64,
) -> Result<DownsampledSubset> {
    let n = graph.n_cells();
    if n < 2 {
        return Err(DataError::new(format!("cannot down-sample {n} cells")).into());
    }
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(DataError::new(format!("down-sample fraction {fraction} is not in (0, 1]")).into());
    }
    let size = target_size(n, fraction);
    let weights = density_weights(graph, alpha);
    let indices = WeightedReservoirSampler::sample_from_iter(
        weights.iter().copied().enumerate(),
        size,
        seed,
    );
    debug!("down-sampled {} of {n} cells (alpha = {alpha})", indices.len());
    let selected_weights = indices.iter().map(|&i| weights[i]).collect();
    Ok(DownsampledSubset {
        indices,
        weights: selected_weights,
    })
}

/// Down-sample the rows of `coords`, estimating density from each cell's
/// distance to its `k`-th nearest neighbor.
pub fn down_sample(
    coords: ArrayView2<'_, f64>,
    fraction: f64,
    k: usize,
    alpha: f64,
    seed: u64,
) -> Result<DownsampledSubset> {
    let n = coords.nrows();
    if n < 2 {
        return Err(DataError::new(format!("cannot down-sample {n} cells")).into());
    }
    let graph = knn(coords, k.min(n - 1), false)?;
    down_sample_with_knn(&graph, fraction, alpha, seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use proptest::prelude::*;

    fn clustered() -> Array2<f64> {
        // 40 cells packed near the origin, 10 spread along a line far away
        Array2::from_shape_fn((50, 2), |(i, j)| {
            if i < 40 {
                0.01 * if j == 0 { (i % 7) as f64 } else { (i / 7) as f64 }
            } else if j == 0 {
                100.0 + 10.0 * (i - 40) as f64
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_target_size() {
        assert_eq!(target_size(100, 0.1), 10);
        assert_eq!(target_size(7, 0.01), 1);
        assert_eq!(target_size(7, 1.0), 7);
        assert_eq!(target_size(5, 0.5), 3);
    }

    #[test]
    fn test_uniform_when_alpha_is_zero() {
        let coords = clustered();
        let graph = knn(coords.view(), 5, false).unwrap();
        let runs = 400;
        let mut counts = [0usize; 50];
        for seed in 0..runs {
            let subset = down_sample_with_knn(&graph, 0.2, 0.0, seed).unwrap();
            assert_eq!(subset.len(), 10);
            assert!(subset.weights.iter().all(|&w| w == 1.0));
            for i in subset.indices {
                counts[i] += 1;
            }
        }
        let freqs: Vec<f64> = counts.iter().map(|&c| c as f64 / runs as f64).collect();
        assert!(freqs.iter().all(|f| (f - 0.2).abs() < 0.1), "{freqs:?}");
        let (mean, var) = stats::mean_var(counts.iter().map(|&c| c as f64));
        assert!((mean - 80.0).abs() < 1e-9);
        let binomial = runs as f64 * 0.2 * 0.8;
        assert!(var < 3.0 * binomial, "variance {var}");
    }

    #[test]
    fn test_alpha_sign_selects_dense_or_sparse() {
        let coords = clustered();
        let dense = down_sample(coords.view(), 0.2, 5, 1.0, 3).unwrap();
        assert!(dense.indices.iter().filter(|&&i| i < 40).count() >= 8);
        let sparse = down_sample(coords.view(), 0.2, 5, -1.0, 3).unwrap();
        assert!(sparse.indices.iter().filter(|&&i| i >= 40).count() >= 8);
    }

    #[test]
    fn test_duplicate_points_stay_finite() {
        let coords = Array2::zeros((6, 2));
        let subset = down_sample(coords.view(), 0.5, 2, 1.0, 0).unwrap();
        assert_eq!(subset.len(), 3);
        assert!(subset.weights.iter().all(|w| w.is_finite()));
    }

    proptest! {
        #[test]
        fn prop_size_and_determinism(
            n in 2usize..60,
            fraction in 0.01f64..=1.0,
            alpha in -2.0f64..2.0,
            seed in any::<u64>(),
        ) {
            let coords = Array2::from_shape_fn((n, 3), |(i, j)| ((i * 7 + j * 13) % 17) as f64 + 0.1 * i as f64);
            let a = down_sample(coords.view(), fraction, 4, alpha, seed).unwrap();
            let b = down_sample(coords.view(), fraction, 4, alpha, seed).unwrap();
            prop_assert_eq!(a.len(), target_size(n, fraction));
            prop_assert!(a.indices.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(a, b);
        }
    }
}
