//! K-means with k-means++ seeding and multiple restarts

use crate::errors::DataError;
use anyhow::Result;
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

const MAX_ITER: usize = 300;
const TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    /// Cluster of every row, in `0..k`.
    pub labels: Vec<usize>,
    pub centroids: Array2<f64>,
    /// Sum of squared distances to the assigned centroids.
    pub inertia: f64,
}

fn sq_dist(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn plus_plus(points: &ArrayView2<'_, f64>, k: usize, rng: &mut Xoshiro256PlusPlus) -> Array2<f64> {
    let (n, dim) = points.dim();
    let mut centroids = Array2::zeros((k, dim));
    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&points.row(first));
    let mut closest: Vec<f64> = points
        .rows()
        .into_iter()
        .map(|p| sq_dist(p, points.row(first)))
        .collect();
    for c in 1..k {
        let next = match WeightedIndex::new(&closest) {
            Ok(dist) => dist.sample(rng),
            // every point coincides with a centroid
            Err(_) => rng.gen_range(0..n),
        };
        centroids.row_mut(c).assign(&points.row(next));
        for (p, d) in points.rows().into_iter().zip(closest.iter_mut()) {
            *d = d.min(sq_dist(p, points.row(next)));
        }
    }
    centroids
}

fn assign(points: &ArrayView2<'_, f64>, centroids: &Array2<f64>) -> (Vec<usize>, f64) {
    let mut inertia = 0.0;
    let labels = points
        .rows()
        .into_iter()
        .map(|p| {
            let (best, d) = centroids
                .rows()
                .into_iter()
                .enumerate()
                .map(|(c, center)| (c, sq_dist(p, center)))
                .fold((0, f64::INFINITY), |acc, x| if x.1 < acc.1 { x } else { acc });
            inertia += d;
            best
        })
        .collect();
    (labels, inertia)
}

fn lloyd(points: &ArrayView2<'_, f64>, k: usize, seed: u64) -> KMeansFit {
    let (n, dim) = points.dim();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut centroids = plus_plus(points, k, &mut rng);
    let scale = points.iter().map(|x| x * x).sum::<f64>() / (n * dim).max(1) as f64;
    let (mut labels, mut inertia) = assign(points, &centroids);
    for _ in 0..MAX_ITER {
        let mut sums = Array2::<f64>::zeros((k, dim));
        let mut counts = vec![0usize; k];
        for (i, &l) in labels.iter().enumerate() {
            let mut s = sums.row_mut(l);
            s += &points.row(i);
            counts[l] += 1;
        }
        let mut shift = 0.0;
        for c in 0..k {
            if counts[c] == 0 {
                // an empty cluster keeps its centroid
                continue;
            }
            let new = sums.row(c).mapv(|v| v / counts[c] as f64);
            shift += new
                .iter()
                .zip(centroids.row(c).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>();
            centroids.row_mut(c).assign(&new);
        }
        let (next_labels, next_inertia) = assign(points, &centroids);
        labels = next_labels;
        inertia = next_inertia;
        if shift <= TOLERANCE * scale {
            break;
        }
    }
    KMeansFit {
        labels,
        centroids,
        inertia,
    }
}

/// K-means of the rows of `points` with `n_init` k-means++ restarts run on
/// the current rayon pool; restart `r` is seeded with `seed + r` and the fit
/// with the lowest inertia wins.
pub fn kmeans(points: ArrayView2<'_, f64>, k: usize, n_init: usize, seed: u64) -> Result<KMeansFit> {
    let n = points.nrows();
    if n == 0 || k == 0 {
        return Err(DataError::new(format!("cannot find {k} clusters among {n} points")).into());
    }
    if points.iter().any(|x| !x.is_finite()) {
        return Err(DataError::new("coordinates contain non-finite values").into());
    }
    let k = k.min(n);
    let fits: Vec<KMeansFit> = (0..n_init.max(1) as u64)
        .into_par_iter()
        .map(|r| lloyd(&points, k, seed.wrapping_add(r)))
        .collect();
    let best = fits
        .into_iter()
        .enumerate()
        .min_by(|a, b| a.1.inertia.total_cmp(&b.1.inertia).then(a.0.cmp(&b.0)))
        .map(|(_, fit)| fit)
        .ok_or_else(|| DataError::new("k-means produced no fit"))?;
    debug!("k-means with k = {k}: inertia {:.4}", best.inertia);
    Ok(best)
}
