use ndarray::{Array2, ArrayView1};

/// k-nearest-neighbor graph: for every cell, the indices of its `k` nearest
/// other cells in ascending distance order, and the matching distances.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnGraph {
    /// `n x k` neighbor indices.
    pub indices: Array2<usize>,
    /// `n x k` euclidean distances, ascending along each row.
    pub distances: Array2<f64>,
}

impl KnnGraph {
    /// Number of cells.
    pub fn n_cells(&self) -> usize {
        self.indices.nrows()
    }

    /// Neighbors per cell.
    pub fn k(&self) -> usize {
        self.indices.ncols()
    }

    /// Neighbor indices of cell `i`.
    pub fn neighbors(&self, i: usize) -> ArrayView1<'_, usize> {
        self.indices.row(i)
    }

    /// Keep only the first `k` neighbors of every cell.
    pub fn truncate(&self, k: usize) -> KnnGraph {
        let k = k.min(self.k());
        KnnGraph {
            indices: self.indices.slice(ndarray::s![.., ..k]).to_owned(),
            distances: self.distances.slice(ndarray::s![.., ..k]).to_owned(),
        }
    }
}
