//! Diffusion maps on the neighbor graph of `pca`

use super::StageContext;
use crate::config::{DiffmapParams, DiffmapSolver};
use crate::errors::DataError;
use crate::linalg::{self, top_eigenpairs};
use anyhow::{Context, Result};
use fxhash::FxHashMap;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sc_types::{basis, Dataset, KnnGraph, UnsValue};
use sprs::{CsMat, TriMat};

/// Symmetric Gaussian affinities with a per-cell bandwidth equal to the
/// distance to its farthest neighbor.
fn affinity(graph: &KnnGraph) -> CsMat<f64> {
    let n = graph.n_cells();
    let k = graph.k();
    let sigma: Vec<f64> = (0..n)
        .map(|i| graph.distances[[i, k - 1]].max(f64::MIN_POSITIVE))
        .collect();
    let mut weights: FxHashMap<(usize, usize), f64> = FxHashMap::default();
    for i in 0..n {
        for (&j, &d) in graph.neighbors(i).iter().zip(graph.distances.row(i)) {
            let (si, sj) = (sigma[i], sigma[j]);
            let s2 = si * si + sj * sj;
            let w = (2.0 * si * sj / s2).sqrt() * (-d * d / s2).exp();
            weights.insert((i.min(j), i.max(j)), w);
        }
    }
    let mut tri = TriMat::with_capacity((n, n), 2 * weights.len());
    for ((i, j), w) in weights {
        tri.add_triplet(i, j, w);
        tri.add_triplet(j, i, w);
    }
    tri.to_csr()
}

/// Shannon entropy of the spectrum raised to the power `t`.
fn spectral_entropy(evals: &[f64], t: usize) -> f64 {
    let powers: Vec<f64> = evals.iter().map(|&l| l.powi(t as i32)).collect();
    let total: f64 = powers.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    powers
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| {
            let q = p / total;
            -q * q.ln()
        })
        .sum()
}

/// Diffusion time at the knee of the entropy curve over `1..=max_t`: the
/// point farthest from the chord joining its ends.
pub fn diffusion_time(evals: &[f64], max_t: usize) -> usize {
    let curve: Vec<f64> = (1..=max_t.max(1)).map(|t| spectral_entropy(evals, t)).collect();
    let last = curve.len() - 1;
    if last < 2 {
        return 1;
    }
    let (dx, dy) = (last as f64, curve[last] - curve[0]);
    let norm = (dx * dx + dy * dy).sqrt();
    let distance = |i: usize| (dy * i as f64 - dx * (curve[i] - curve[0])).abs() / norm;
    (0..=last)
        .max_by(|&a, &b| distance(a).total_cmp(&distance(b)).then(b.cmp(&a)))
        .map_or(1, |i| i + 1)
}

/// `sum_{i=1..t} l^i` for every eigenvalue.
fn multiscale_weights(evals: &[f64], t: usize) -> Array1<f64> {
    evals
        .iter()
        .map(|&l| {
            if (1.0 - l).abs() < 1e-12 {
                t as f64
            } else {
                l * (1.0 - l.powi(t as i32)) / (1.0 - l)
            }
        })
        .collect()
}

pub fn run(ctx: &StageContext<'_>, ds: &mut Dataset, params: &DiffmapParams) -> Result<()> {
    let graph = ctx.neighbors(ds, basis::PCA, ctx.config.knn.k)?;
    let n = graph.n_cells();
    let mut n_components = params.n_components;
    if n_components + 1 > n {
        warn!("{n} cells < requested diffusion components {n_components} + 1, reducing to {}", n - 1);
        n_components = n - 1;
    }

    let w = affinity(&graph);
    let degree: Vec<f64> = w
        .outer_iterator()
        .map(|row| row.data().iter().sum::<f64>())
        .collect();
    if degree.iter().any(|&d| !d.is_finite() || d <= 0.0) {
        return Err(DataError::new("diffusion kernel has a cell without affinity").into());
    }
    let inv_sqrt: Vec<f64> = degree.iter().map(|d| d.sqrt().recip()).collect();
    let mut s = w;
    for (i, mut row) in s.outer_iterator_mut().enumerate() {
        for (j, v) in row.iter_mut() {
            *v *= inv_sqrt[i] * inv_sqrt[j];
        }
    }

    let (n_iter, oversample) = match params.solver {
        DiffmapSolver::Eigsh => (30, 10),
        DiffmapSolver::Randomized => (7, (n_components + 1).max(10)),
    };
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(ctx.seed());
    // lazy operator (I + S) / 2 keeps the spectrum non-negative
    let (mu, vectors) = top_eigenpairs(
        n,
        n_components + 1,
        |q| {
            let sq: Array2<f64> = &s * &q;
            (&sq + &q) / 2.0
        },
        n_iter,
        oversample,
        &mut rng,
    )
    .context("diffusion map eigenvectors")?;

    let evals: Vec<f64> = mu.iter().skip(1).map(|&m| (2.0 * m - 1.0).clamp(0.0, 1.0)).collect();
    let t = diffusion_time(&evals, params.max_t);
    let weights = multiscale_weights(&evals, t);
    let mut coords = vectors.slice(ndarray::s![.., 1..]).to_owned();
    for (mut row, &d) in coords.axis_iter_mut(Axis(0)).zip(&inv_sqrt) {
        row *= d;
        row *= &weights;
    }
    debug!("diffusion eigenvalues {:?}", &evals[..evals.len().min(5)]);
    info!(
        "computed {} diffusion components of {n} cells, diffusion time {t}",
        coords.ncols()
    );
    ds.set_uns("diffmap_evals", UnsValue::Floats(evals));
    ds.set_uns("diffmap_t", UnsValue::Float(t as f64));
    ds.insert_embedding(basis::DIFFMAP, coords)?;
    Ok(())
}

/// Three principal components of the diffusion map.
pub fn run_to_3d(ctx: &StageContext<'_>, ds: &mut Dataset) -> Result<()> {
    let coords = ds.require_embedding(basis::DIFFMAP)?;
    let fit = linalg::pca(coords.view(), 3, ctx.seed()).context("diffusion map PCA")?;
    info!("projected {} diffusion components to 3 dimensions", coords.ncols());
    ds.insert_embedding(basis::DIFFMAP_PCA, fit.scores)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StageKind;
    use crate::stages::testing;

    #[test]
    fn test_diffusion_time_is_in_range() {
        let evals = [0.99, 0.9, 0.5, 0.2, 0.05];
        let t = diffusion_time(&evals, 100);
        assert!((1..=100).contains(&t));
        assert_eq!(diffusion_time(&evals, 1), 1);
        assert_eq!(diffusion_time(&[0.0, 0.0], 10), 1);
    }

    #[test]
    fn test_multiscale_weights() {
        let w = multiscale_weights(&[0.5, 1.0], 3);
        assert!((w[0] - 0.875).abs() < 1e-12);
        assert_eq!(w[1], 3.0);
    }

    #[test]
    fn test_first_component_separates_blobs() {
        let config = testing::config();
        let stage = testing::planned(StageKind::Diffmap, None);
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        let mut ds = testing::blobs(2, 20);
        let params = DiffmapParams {
            n_components: 4,
            solver: DiffmapSolver::Eigsh,
            max_t: 50,
        };
        run(&ctx, &mut ds, &params).unwrap();
        let dm = ds.embedding(basis::DIFFMAP).unwrap();
        assert_eq!(dm.dim(), (40, 4));
        let first = dm.column(0);
        let sign = first[0].signum();
        assert!(first.iter().take(20).all(|v| v.signum() == sign));
        assert!(first.iter().skip(20).all(|v| v.signum() == -sign));

        let stage = testing::planned(StageKind::DiffmapTo3d, None);
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        run_to_3d(&ctx, &mut ds).unwrap();
        assert_eq!(ds.embedding(basis::DIFFMAP_PCA).unwrap().dim(), (40, 3));
    }
}
