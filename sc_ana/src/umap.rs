//! UMAP: full runs through `umap_rs`, plus the fuzzy graph and SGD epochs
//! used to polish an existing layout

use crate::errors::DataError;
use anyhow::Result;
use log::debug;
use ndarray::{Array1, Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use sc_types::KnnGraph;
use std::collections::BTreeMap;
use umap_rs::dist::DistanceType;
use umap_rs::umap::Umap;

const N_COMPONENTS: usize = 2;
const SMOOTH_K_TOLERANCE: f64 = 1e-5;
const MIN_K_DIST_SCALE: f64 = 1e-3;
const SMOOTH_K_ITERATIONS: usize = 64;
const NEGATIVE_SAMPLE_RATE: f64 = 5.0;
const GRADIENT_CLIP: f64 = 4.0;

/// Symmetric fuzzy graph as a list of directed edges.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyGraph {
    pub n_vertices: usize,
    pub head: Vec<usize>,
    pub tail: Vec<usize>,
    pub weights: Vec<f64>,
}

/// Per-cell bandwidth `sigma` and nearest-neighbor distance `rho` such that
/// the fuzzy membership strengths of each row sum to `log2(k)`.
pub fn smooth_knn_dist(distances: ArrayView2<'_, f64>, k: usize) -> (Array1<f64>, Array1<f64>) {
    let n = distances.nrows();
    let target = (k as f64).log2();
    let mean_distance = distances.mean().unwrap_or(0.0);
    let mut sigmas = Array1::zeros(n);
    let mut rhos = Array1::zeros(n);

    for i in 0..n {
        let row = distances.row(i);
        let rho = row.iter().copied().find(|&d| d > 0.0).unwrap_or(0.0);
        let (mut lo, mut hi, mut mid) = (0.0, f64::INFINITY, 1.0);
        for _ in 0..SMOOTH_K_ITERATIONS {
            let psum: f64 = row
                .iter()
                .map(|&d| {
                    let d = d - rho;
                    if d > 0.0 {
                        (-d / mid).exp()
                    } else {
                        1.0
                    }
                })
                .sum();
            if (psum - target).abs() < SMOOTH_K_TOLERANCE {
                break;
            }
            if psum > target {
                hi = mid;
                mid = (lo + hi) / 2.0;
            } else {
                lo = mid;
                mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
            }
        }
        let floor = if rho > 0.0 {
            MIN_K_DIST_SCALE * row.mean().unwrap_or(0.0)
        } else {
            MIN_K_DIST_SCALE * mean_distance
        };
        sigmas[i] = mid.max(floor);
        rhos[i] = rho;
    }
    (sigmas, rhos)
}

/// Fuzzy union of the local fuzzy simplicial sets of every cell.
///
/// `graph` holds the `k - 1` nearest other cells of each cell; the cell
/// itself counts as its first neighbor.
pub fn fuzzy_simplicial_set(graph: &KnnGraph) -> FuzzyGraph {
    let n = graph.n_cells();
    let (sigmas, rhos) = smooth_knn_dist(graph.distances.view(), graph.k() + 1);
    let mut strengths: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for i in 0..n {
        for (j, &nb) in graph.neighbors(i).iter().enumerate() {
            let d = graph.distances[[i, j]] - rhos[i];
            let val = if d <= 0.0 || sigmas[i] == 0.0 {
                1.0
            } else {
                (-d / sigmas[i]).exp()
            };
            if val > 0.0 && nb != i {
                strengths.insert((i, nb), val);
            }
        }
    }
    // w + w^T - w * w^T
    let mut union: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for (&(i, j), &w) in &strengths {
        let wt = strengths.get(&(j, i)).copied().unwrap_or(0.0);
        let val = w + wt - w * wt;
        union.insert((i, j), val);
        union.insert((j, i), val);
    }
    let mut fuzzy = FuzzyGraph {
        n_vertices: n,
        head: Vec::with_capacity(union.len()),
        tail: Vec::with_capacity(union.len()),
        weights: Vec::with_capacity(union.len()),
    };
    for ((i, j), w) in union {
        fuzzy.head.push(i);
        fuzzy.tail.push(j);
        fuzzy.weights.push(w);
    }
    fuzzy
}

/// Fit `a` and `b` of the low-dimensional similarity curve
/// `1 / (1 + a * d^(2b))` to an offset exponential decay, by
/// Levenberg-Marquardt least squares.
pub fn find_ab_params(spread: f64, min_dist: f64) -> (f64, f64) {
    let n_points = 300;
    let xs: Vec<f64> = (0..n_points)
        .map(|i| spread * 3.0 * i as f64 / (n_points - 1) as f64)
        .collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.0
            } else {
                (-(x - min_dist) / spread).exp()
            }
        })
        .collect();
    let sse = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&ys)
            .map(|(&x, &y)| {
                let r = 1.0 / (1.0 + a * x.powf(2.0 * b)) - y;
                r * r
            })
            .sum()
    };

    let (mut a, mut b) = (1.0, 1.0);
    let mut lambda = 1e-3;
    let mut current = sse(a, b);
    for _ in 0..500 {
        // normal equations J^T J and J^T r
        let (mut jaa, mut jab, mut jbb, mut ga, mut gb) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&x, &y) in xs.iter().zip(&ys) {
            let x2b = x.powf(2.0 * b);
            let denom = 1.0 + a * x2b;
            let r = 1.0 / denom - y;
            let da = -x2b / (denom * denom);
            let db = if x > 0.0 {
                -2.0 * a * x2b * x.ln() / (denom * denom)
            } else {
                0.0
            };
            jaa += da * da;
            jab += da * db;
            jbb += db * db;
            ga += da * r;
            gb += db * r;
        }
        let (maa, mbb) = (jaa * (1.0 + lambda), jbb * (1.0 + lambda));
        let det = maa * mbb - jab * jab;
        if det.abs() < f64::MIN_POSITIVE {
            break;
        }
        let step_a = -(mbb * ga - jab * gb) / det;
        let step_b = -(maa * gb - jab * ga) / det;
        let (na, nb) = (a + step_a, b + step_b);
        let candidate = if na > 0.0 && nb > 0.0 { sse(na, nb) } else { f64::INFINITY };
        if candidate < current {
            let improvement = current - candidate;
            a = na;
            b = nb;
            current = candidate;
            lambda = (lambda / 10.0).max(1e-12);
            if improvement < 1e-14 {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e12 {
                break;
            }
        }
    }
    (a, b)
}

/// Settings of [`optimize_layout`].
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutSgd {
    pub a: f64,
    pub b: f64,
    pub n_epochs: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

fn clip(v: f64) -> f64 {
    v.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

/// Move `embedding` to minimize the fuzzy set cross entropy against `graph`.
pub fn optimize_layout(embedding: &mut Array2<f64>, graph: &FuzzyGraph, sgd: &LayoutSgd) -> Result<()> {
    let (n, dim) = embedding.dim();
    if n != graph.n_vertices {
        return Err(DataError::new(format!(
            "layout has {n} rows but the graph has {} vertices",
            graph.n_vertices
        ))
        .into());
    }
    if sgd.n_epochs == 0 || graph.weights.is_empty() {
        return Ok(());
    }

    // Drop edges too weak to be sampled within the epoch budget.
    let w_max = graph.weights.iter().copied().fold(0.0, f64::max);
    let threshold = w_max / sgd.n_epochs as f64;
    let edges: Vec<(usize, usize, f64)> = graph
        .head
        .iter()
        .zip(&graph.tail)
        .zip(&graph.weights)
        .filter(|(_, &w)| w >= threshold)
        .map(|((&h, &t), &w)| (h, t, w_max / w))
        .collect();
    let mut next_sample: Vec<f64> = edges.iter().map(|e| e.2).collect();
    let mut next_negative: Vec<f64> = edges.iter().map(|e| e.2 / NEGATIVE_SAMPLE_RATE).collect();

    let (a, b) = (sgd.a, sgd.b);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(sgd.seed);
    let mut alpha = sgd.learning_rate;
    let mut grad = vec![0.0; dim];

    for epoch in 0..sgd.n_epochs {
        let now = epoch as f64;
        for (e, &(j, k, eps)) in edges.iter().enumerate() {
            if next_sample[e] > now {
                continue;
            }
            let d2: f64 = (0..dim)
                .map(|d| (embedding[[j, d]] - embedding[[k, d]]).powi(2))
                .sum();
            let coeff = if d2 > 0.0 {
                -2.0 * a * b * d2.powf(b - 1.0) / (a * d2.powf(b) + 1.0)
            } else {
                0.0
            };
            for (d, g) in grad.iter_mut().enumerate() {
                *g = clip(coeff * (embedding[[j, d]] - embedding[[k, d]]));
            }
            for (d, &g) in grad.iter().enumerate() {
                embedding[[j, d]] += g * alpha;
                embedding[[k, d]] -= g * alpha;
            }
            next_sample[e] += eps;

            let eps_neg = eps / NEGATIVE_SAMPLE_RATE;
            let n_neg = ((now - next_negative[e]) / eps_neg).max(0.0) as usize;
            for _ in 0..n_neg {
                let other = rng.gen_range(0..n);
                if other == j {
                    continue;
                }
                let d2: f64 = (0..dim)
                    .map(|d| (embedding[[j, d]] - embedding[[other, d]]).powi(2))
                    .sum();
                if d2 <= 0.0 {
                    continue;
                }
                let coeff = 2.0 * b / ((0.001 + d2) * (a * d2.powf(b) + 1.0));
                for d in 0..dim {
                    let g = clip(coeff * (embedding[[j, d]] - embedding[[other, d]]));
                    embedding[[j, d]] += g * alpha;
                }
            }
            next_negative[e] += n_neg as f64 * eps_neg;
        }
        alpha = sgd.learning_rate * (1.0 - (epoch + 1) as f64 / sgd.n_epochs as f64);
    }
    debug!("optimized layout of {n} cells over {} epochs", sgd.n_epochs);
    Ok(())
}

/// Full 2D UMAP of the rows of `coords` with `n_neighbors` neighbors per
/// cell, the cell itself included.
pub fn umap_embed(
    coords: ArrayView2<'_, f64>,
    n_neighbors: usize,
    min_dist: f64,
    spread: f64,
    seed: u64,
    threads: usize,
) -> Result<Array2<f64>> {
    let n = coords.nrows();
    if n < 2 {
        return Err(DataError::new(format!("need at least 2 cells for UMAP, got {n}")).into());
    }
    if coords.iter().any(|x| !x.is_finite()) {
        return Err(DataError::new("UMAP input contains non-finite values").into());
    }
    let umap = Umap::new(
        Some(DistanceType::euclidean()),
        N_COMPONENTS,
        min_dist,
        spread,
        n_neighbors.min(n - 1).max(1),
        None,
    );
    let proj = coords.as_standard_layout().to_owned();
    let mut state = umap.initialize_fit(&proj, Some(seed), threads.max(1));
    state.optimize();
    debug!("umap of {n} cells done");
    Ok(state.embedding)
}
