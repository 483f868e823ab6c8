//! Exact k-nearest-neighbor search on a kd-tree

use crate::errors::DataError;
use anyhow::Result;
use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use sc_types::KnnGraph;

/// kNN of every row of `points`, excluding the row itself.
///
/// `k` is clamped to `n - 1`. Neighbors are ordered by distance, then by
/// index. `parallel` spreads the queries over the current rayon pool.
pub fn knn(points: ArrayView2<'_, f64>, k: usize, parallel: bool) -> Result<KnnGraph> {
    let (n, dims) = points.dim();
    if n < 2 {
        return Err(DataError::new(format!("need at least 2 cells for a neighbor graph, got {n}")).into());
    }
    if points.iter().any(|x| !x.is_finite()) {
        return Err(DataError::new("coordinates contain non-finite values").into());
    }
    let k = k.clamp(1, n - 1);

    let rows: Vec<Vec<f64>> = points.rows().into_iter().map(|r| r.to_vec()).collect();
    let mut tree = KdTree::new(dims.max(1));
    for (i, row) in rows.iter().enumerate() {
        tree.add(row.as_slice(), i)
            .map_err(|e| DataError::new(format!("cannot index cell {i}: {e:?}")))?;
    }

    let query = |i: usize| -> Result<Vec<(f64, usize)>> {
        // one extra hit for the cell itself
        let hits = tree
            .nearest(&rows[i], k + 1, &squared_euclidean)
            .map_err(|e| DataError::new(format!("neighbor query of cell {i}: {e:?}")))?;
        let mut row: Vec<(f64, usize)> = hits
            .into_iter()
            .filter(|&(_, &j)| j != i)
            .map(|(d2, &j)| (d2, j))
            .collect();
        row.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        row.truncate(k);
        Ok(row)
    };
    let found: Vec<Vec<(f64, usize)>> = if parallel {
        (0..n).into_par_iter().map(query).collect::<Result<_>>()?
    } else {
        (0..n).map(query).collect::<Result<_>>()?
    };

    let mut indices = Array2::zeros((n, k));
    let mut distances = Array2::zeros((n, k));
    for (i, row) in found.into_iter().enumerate() {
        for (j, (d2, idx)) in row.into_iter().enumerate() {
            indices[[i, j]] = idx;
            distances[[i, j]] = d2.sqrt();
        }
    }
    Ok(KnnGraph { indices, distances })
}
