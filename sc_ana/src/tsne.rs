//! t-SNE: full Barnes-Hut runs, and the exact gradient steps used to polish
//! an existing layout

use crate::errors::DataError;
use anyhow::Result;
use bhtsne::BarnesHutTSNE;
use log::{debug, warn};
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use sc_types::KnnGraph;
use sprs::{CsMat, TriMat};

pub const MAX_ITER: usize = 1000;
const STOP_LYING_ITER: usize = 250;
const MOM_SWITCH_ITER: usize = 250;
const THETA: f64 = 0.5;
const N_COMPONENTS: u32 = 2;
const FINAL_MOMENTUM: f64 = 0.8;
const MIN_GAIN: f64 = 0.01;
const PERPLEXITY_TOLERANCE: f64 = 1e-5;

/// Number of neighbors needed to calibrate `perplexity` on `n` cells.
pub fn neighbors_for_perplexity(n: usize, perplexity: f64) -> usize {
    ((3.0 * perplexity).floor() as usize).clamp(1, n.saturating_sub(1).max(1))
}

/// Largest usable perplexity for `n` cells.
pub fn effective_perplexity(n: usize, perplexity: f64) -> f64 {
    perplexity.min(1f64.max(-1.0 + (n as f64 - 1.0) / 3.0))
}

/// Symmetric joint probabilities `P` from Gaussian kernels whose bandwidth
/// is tuned per cell to the requested perplexity.
pub fn tsne_affinities(graph: &KnnGraph, perplexity: f64) -> CsMat<f64> {
    let n = graph.n_cells();
    let target_entropy = perplexity.ln();
    let mut tri = TriMat::new((n, n));
    for i in 0..n {
        let d2: Vec<f64> = graph.distances.row(i).iter().map(|d| d * d).collect();
        let (mut beta, mut lo, mut hi) = (1.0, 0.0, f64::INFINITY);
        let mut p = vec![0.0; d2.len()];
        for _ in 0..200 {
            let d_min = d2.iter().copied().fold(f64::INFINITY, f64::min);
            for (pj, &d) in p.iter_mut().zip(&d2) {
                *pj = (-beta * (d - d_min)).exp();
            }
            let sum: f64 = p.iter().sum();
            let mean_d: f64 = p.iter().zip(&d2).map(|(pj, d)| pj * (d - d_min)).sum::<f64>() / sum;
            let entropy = sum.ln() + beta * mean_d;
            let diff = entropy - target_entropy;
            if diff.abs() < PERPLEXITY_TOLERANCE {
                break;
            }
            if diff > 0.0 {
                lo = beta;
                beta = if hi.is_infinite() { beta * 2.0 } else { (beta + hi) / 2.0 };
            } else {
                hi = beta;
                beta = (beta + lo) / 2.0;
            }
        }
        let sum: f64 = p.iter().sum();
        for (&j, &pj) in graph.neighbors(i).iter().zip(&p) {
            let v = pj / sum / (2.0 * n as f64);
            tri.add_triplet(i, j, v);
            tri.add_triplet(j, i, v);
        }
    }
    // duplicates are summed, giving (P + P^T) / 2n
    tri.to_csr()
}

fn gradient(y: &Array2<f64>, p: &CsMat<f64>) -> Array2<f64> {
    let (n, dim) = y.dim();
    // Repulsion per row: sum_j q_ij^2 (y_i - y_j) and sum_j q_ij (unnormalized).
    let rows: Vec<(Vec<f64>, f64)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut rep = vec![0.0; dim];
            let mut z = 0.0;
            for j in 0..n {
                if j == i {
                    continue;
                }
                let d2: f64 = (0..dim).map(|d| (y[[i, d]] - y[[j, d]]).powi(2)).sum();
                let q = 1.0 / (1.0 + d2);
                z += q;
                for (d, r) in rep.iter_mut().enumerate() {
                    *r += q * q * (y[[i, d]] - y[[j, d]]);
                }
            }
            (rep, z)
        })
        .collect();
    let z: f64 = rows.iter().map(|r| r.1).sum::<f64>().max(f64::MIN_POSITIVE);

    let mut grad = Array2::zeros((n, dim));
    for (i, row) in p.outer_iterator().enumerate() {
        for (j, &pij) in row.iter() {
            let d2: f64 = (0..dim).map(|d| (y[[i, d]] - y[[j, d]]).powi(2)).sum();
            let q = 1.0 / (1.0 + d2);
            for d in 0..dim {
                grad[[i, d]] += pij * q * (y[[i, d]] - y[[j, d]]);
            }
        }
        for d in 0..dim {
            grad[[i, d]] -= rows[i].0[d] / z;
        }
    }
    grad * 4.0
}

/// `n_iter` exact gradient steps from `y` with momentum and per-coordinate
/// gains, without early exaggeration.
pub fn tsne_refine(y: &mut Array2<f64>, p: &CsMat<f64>, learning_rate: f64, n_iter: usize) -> Result<()> {
    let n = y.nrows();
    if p.rows() != n || p.cols() != n {
        return Err(DataError::new(format!(
            "affinity matrix of shape {:?} does not match a layout of {n} cells",
            p.shape()
        ))
        .into());
    }
    let mut update = Array2::<f64>::zeros(y.dim());
    let mut gains = Array2::<f64>::ones(y.dim());
    for iter in 0..n_iter {
        let grad = gradient(y, p);
        ndarray::Zip::from(&mut gains)
            .and(&mut update)
            .and(&grad)
            .for_each(|gain, upd, &g| {
                *gain = if (g > 0.0) != (*upd > 0.0) {
                    *gain + 0.2
                } else {
                    (*gain * 0.8).max(MIN_GAIN)
                };
                *upd = FINAL_MOMENTUM * *upd - learning_rate * *gain * g;
            });
        *y += &update;
        if let Some(mean) = y.mean_axis(Axis(0)) {
            *y -= &mean;
        }
        if iter % 50 == 49 {
            debug!("t-SNE refinement iteration {}", iter + 1);
        }
    }
    Ok(())
}

/// 2D Barnes-Hut t-SNE of the rows of `coords`. Too few cells for the
/// perplexity give an all-zero layout.
pub fn tsne_embed(coords: ArrayView2<'_, f64>, perplexity: f64, max_iter: usize, seed: u64) -> Result<Array2<f64>> {
    if coords.iter().any(|x| !x.is_finite()) {
        return Err(DataError::new("t-SNE input contains non-finite values").into());
    }
    let n = coords.nrows();
    let mut tsne = BarnesHutTSNE::default();
    tsne.seed = Some(seed as u32);
    tsne.perplexity = effective_perplexity(n, perplexity);
    tsne.max_iter = max_iter;
    tsne.theta = THETA;
    tsne.n_dims = N_COMPONENTS;
    tsne.stop_lying_iter = Some(STOP_LYING_ITER.min(max_iter));
    tsne.mom_switch_iter = Some(MOM_SWITCH_ITER.min(max_iter));

    if ((n.max(1) - 1) as f64) < 3.0 * tsne.perplexity {
        warn!("{n} cells are too few for t-SNE, the layout is all zeros");
        return Ok(Array2::zeros((n, N_COMPONENTS as usize)));
    }
    let mut proj = coords.as_standard_layout().to_owned();
    tsne.init(&mut proj);
    while !tsne.run_n(tsne.max_iter) {}
    Ok(tsne.result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbors::knn;

    fn two_blobs() -> Array2<f64> {
        Array2::from_shape_fn((40, 3), |(i, j)| {
            let offset = if i < 20 { 0.0 } else { 30.0 };
            offset + ((i * 7 + j * 3) % 5) as f64 * 0.3 + i as f64 * 0.01
        })
    }

    #[test]
    fn test_affinities_are_symmetric_and_normalized() {
        let x = two_blobs();
        let graph = knn(x.view(), 9, false).unwrap();
        let p = tsne_affinities(&graph, 3.0);
        let total: f64 = p.data().iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        let dense = p.to_dense();
        for i in 0..40 {
            for j in 0..40 {
                assert!((dense[[i, j]] - dense[[j, i]]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn test_small_inputs_give_zero_layout() {
        let x = Array2::from_shape_fn((3, 2), |(i, j)| (i + j) as f64);
        let y = tsne_embed(x.view(), 30.0, 10, 0).unwrap();
        assert_eq!(y, Array2::<f64>::zeros((3, 2)));
    }

    #[test]
    fn test_blobs_are_separated() {
        let x = two_blobs();
        let y = tsne_embed(x.view(), 5.0, 400, 1).unwrap();
        assert_eq!(y.dim(), (40, 2));
        let centroid = |r: std::ops::Range<usize>| {
            let m = y.slice(ndarray::s![r, ..]).mean_axis(Axis(0)).unwrap();
            (m[0], m[1])
        };
        let (a, b) = (centroid(0..20), centroid(20..40));
        let between = ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
        let within = (0..20)
            .map(|i| ((y[[i, 0]] - a.0).powi(2) + (y[[i, 1]] - a.1).powi(2)).sqrt())
            .sum::<f64>()
            / 20.0;
        assert!(between > within, "between {between}, within {within}");
    }

    #[test]
    fn test_refine_keeps_shape_and_order() {
        let x = two_blobs();
        let graph = knn(x.view(), 9, false).unwrap();
        let p = tsne_affinities(&graph, 3.0);
        let mut y = Array2::from_shape_fn((40, 2), |(i, j)| (i * 2 + j) as f64 * 0.1);
        tsne_refine(&mut y, &p, 10.0, 5).unwrap();
        assert_eq!(y.dim(), (40, 2));
        assert!(y.iter().all(|v| v.is_finite()));
        let mut wrong = Array2::zeros((10, 2));
        assert!(tsne_refine(&mut wrong, &p, 10.0, 5).is_err());
    }
}
