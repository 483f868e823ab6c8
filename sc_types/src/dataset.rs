//! The shared in-memory dataset mutated by the analysis stages

use crate::knn::KnnGraph;
use crate::metadata::MetadataTable;
use anyhow::{bail, ensure, Context, Result};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Processing state of the expression matrix. Cells and genes may only be
/// removed while the matrix is still `Raw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatrixState {
    /// Unfiltered counts.
    Raw,
    /// QC-filtered counts; cell and gene order is now fixed.
    Filtered,
    /// Size-factor normalized, log-transformed values.
    Normalized,
}

impl fmt::Display for MatrixState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatrixState::Raw => "raw",
            MatrixState::Filtered => "filtered",
            MatrixState::Normalized => "normalized",
        })
    }
}

/// Unstructured per-dataset results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnsValue {
    /// A scalar.
    Float(f64),
    /// A vector of scalars, e.g. eigenvalues.
    Floats(Vec<f64>),
    /// Text.
    Text(String),
}

/// Dense, batch-corrected values for a subset of the genes.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedLayer {
    /// Gene indices of the columns of `values`.
    pub features: Vec<usize>,
    /// `cells x features.len()` corrected expression.
    pub values: Array2<f64>,
}

/// Cell-by-gene expression matrix with its metadata and derived results.
///
/// Every embedding matrix has exactly one row per cell, in cell order.
#[derive(Debug, Clone)]
pub struct Dataset {
    barcodes: Vec<String>,
    feature_names: Vec<String>,
    matrix: CsMat<f64>,
    state: MatrixState,
    obs: MetadataTable,
    var: MetadataTable,
    obsm: BTreeMap<String, Array2<f64>>,
    uns: BTreeMap<String, UnsValue>,
    corrected: Option<CorrectedLayer>,
    knn_cache: HashMap<(String, usize), KnnGraph>,
}

impl Dataset {
    /// Wrap a CSR matrix (rows = cells, columns = genes) in `Raw` state.
    pub fn new(barcodes: Vec<String>, feature_names: Vec<String>, matrix: CsMat<f64>) -> Result<Self> {
        ensure!(matrix.is_csr(), "expression matrix must be stored row-major (CSR)");
        ensure!(
            matrix.rows() == barcodes.len() && matrix.cols() == feature_names.len(),
            "matrix shape {:?} does not match {} barcodes x {} features",
            matrix.shape(),
            barcodes.len(),
            feature_names.len()
        );
        let n_cells = barcodes.len();
        let n_features = feature_names.len();
        Ok(Dataset {
            barcodes,
            feature_names,
            matrix,
            state: MatrixState::Raw,
            obs: MetadataTable::new(n_cells),
            var: MetadataTable::new(n_features),
            obsm: BTreeMap::new(),
            uns: BTreeMap::new(),
            corrected: None,
            knn_cache: HashMap::new(),
        })
    }

    /// Build a dataset from a dense `cells x genes` matrix, keeping non-zeros.
    pub fn from_dense(
        barcodes: Vec<String>,
        feature_names: Vec<String>,
        counts: ArrayView2<'_, f64>,
    ) -> Result<Self> {
        let mut tri = TriMat::new(counts.dim());
        for ((i, j), &v) in counts.indexed_iter() {
            if v != 0.0 {
                tri.add_triplet(i, j, v);
            }
        }
        Dataset::new(barcodes, feature_names, tri.to_csr())
    }

    /// Declare the processing state of a dataset loaded from a processed file.
    pub fn with_state(mut self, state: MatrixState) -> Self {
        self.state = state;
        self
    }

    /// Number of cells.
    pub fn n_cells(&self) -> usize {
        self.barcodes.len()
    }

    /// Number of genes.
    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    /// Cell barcodes, in row order.
    pub fn barcodes(&self) -> &[String] {
        &self.barcodes
    }

    /// Gene names, in column order.
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// The expression matrix.
    pub fn matrix(&self) -> &CsMat<f64> {
        &self.matrix
    }

    /// Current matrix state.
    pub fn state(&self) -> MatrixState {
        self.state
    }

    /// Advance the matrix state. States only move forward.
    pub fn set_state(&mut self, state: MatrixState) -> Result<()> {
        ensure!(
            state >= self.state,
            "cannot move matrix state back from {} to {state}",
            self.state
        );
        self.state = state;
        Ok(())
    }

    /// Cell metadata.
    pub fn obs(&self) -> &MetadataTable {
        &self.obs
    }

    /// Mutable cell metadata.
    pub fn obs_mut(&mut self) -> &mut MetadataTable {
        &mut self.obs
    }

    /// Gene metadata.
    pub fn var(&self) -> &MetadataTable {
        &self.var
    }

    /// Mutable gene metadata.
    pub fn var_mut(&mut self) -> &mut MetadataTable {
        &mut self.var
    }

    /// Look up an embedding.
    pub fn embedding(&self, basis: &str) -> Option<&Array2<f64>> {
        self.obsm.get(basis)
    }

    /// Look up an embedding that must be present.
    pub fn require_embedding(&self, basis: &str) -> Result<&Array2<f64>> {
        self.obsm
            .get(basis)
            .with_context(|| format!("basis '{basis}' is not present in the embedding registry"))
    }

    /// True if the basis is present.
    pub fn has_embedding(&self, basis: &str) -> bool {
        self.obsm.contains_key(basis)
    }

    /// Registered basis names.
    pub fn embedding_names(&self) -> impl Iterator<Item = &str> {
        self.obsm.keys().map(String::as_str)
    }

    /// Register or replace an embedding. Invalidates cached neighbor graphs
    /// computed on the same basis.
    pub fn insert_embedding(&mut self, basis: impl Into<String>, coords: Array2<f64>) -> Result<()> {
        let basis = basis.into();
        ensure!(
            coords.nrows() == self.n_cells(),
            "embedding '{basis}' has {} rows but the dataset has {} cells",
            coords.nrows(),
            self.n_cells()
        );
        self.knn_cache.retain(|(b, _), _| *b != basis);
        self.obsm.insert(basis, coords);
        Ok(())
    }

    /// Unstructured results.
    pub fn uns(&self) -> &BTreeMap<String, UnsValue> {
        &self.uns
    }

    /// Record an unstructured result.
    pub fn set_uns(&mut self, key: impl Into<String>, value: UnsValue) {
        self.uns.insert(key.into(), value);
    }

    /// Batch-corrected dense layer, if any.
    pub fn corrected(&self) -> Option<&CorrectedLayer> {
        self.corrected.as_ref()
    }

    /// Store the batch-corrected dense layer.
    pub fn set_corrected(&mut self, layer: CorrectedLayer) -> Result<()> {
        ensure!(
            layer.values.nrows() == self.n_cells() && layer.values.ncols() == layer.features.len(),
            "corrected layer shape {:?} does not match {} cells x {} features",
            layer.values.dim(),
            self.n_cells(),
            layer.features.len()
        );
        self.corrected = Some(layer);
        Ok(())
    }

    /// Cached neighbor graph on `basis` with exactly `k` neighbors.
    pub fn cached_knn(&self, basis: &str, k: usize) -> Option<&KnnGraph> {
        self.knn_cache.get(&(basis.to_string(), k))
    }

    /// Cache a neighbor graph computed on `basis`.
    pub fn cache_knn(&mut self, basis: &str, graph: KnnGraph) {
        self.knn_cache.insert((basis.to_string(), graph.k()), graph);
    }

    /// Total counts per cell.
    pub fn row_sums(&self) -> Array1<f64> {
        self.matrix
            .outer_iterator()
            .map(|row| row.data().iter().sum::<f64>())
            .collect()
    }

    /// Number of non-zero entries per gene.
    pub fn column_nnz(&self) -> Array1<usize> {
        let mut nnz = Array1::zeros(self.n_features());
        for row in self.matrix.outer_iterator() {
            for &j in row.indices() {
                nnz[j] += 1;
            }
        }
        nnz
    }

    /// Densify the given gene columns, in the given order.
    pub fn dense_columns(&self, features: &[usize]) -> Array2<f64> {
        let mut position = vec![None; self.n_features()];
        for (p, &j) in features.iter().enumerate() {
            position[j] = Some(p);
        }
        let mut dense = Array2::zeros((self.n_cells(), features.len()));
        for (i, row) in self.matrix.outer_iterator().enumerate() {
            for (j, &v) in row.iter() {
                if let Some(p) = position[j] {
                    dense[[i, p]] = v;
                }
            }
        }
        dense
    }

    /// Rewrite the stored values of every row in place. The closure receives
    /// the row index, the column indices and the values of that row.
    pub fn map_rows(&mut self, mut f: impl FnMut(usize, &[usize], &mut [f64])) -> Result<()> {
        let shape = self.matrix.shape();
        let matrix = std::mem::replace(&mut self.matrix, CsMat::zero(shape));
        let (indptr, indices, mut data) = matrix.into_raw_storage();
        for i in 0..shape.0 {
            let (start, end) = (indptr[i], indptr[i + 1]);
            f(i, &indices[start..end], &mut data[start..end]);
        }
        self.matrix = CsMat::try_new(shape, indptr, indices, data)
            .map_err(|(_, _, _, e)| anyhow::anyhow!("invalid matrix after row update: {e}"))?;
        Ok(())
    }

    /// Keep only the cells in `keep`, in the given order. Only allowed while
    /// the matrix is `Raw`.
    pub fn subset_cells(&mut self, keep: &[usize]) -> Result<()> {
        if self.state != MatrixState::Raw {
            bail!(
                "cannot remove cells from a {} matrix; cell order is fixed after filtering",
                self.state
            );
        }
        let mut indptr = Vec::with_capacity(keep.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for &i in keep {
            let row = self
                .matrix
                .outer_view(i)
                .with_context(|| format!("cell index {i} out of range"))?;
            indices.extend_from_slice(row.indices());
            data.extend_from_slice(row.data());
            indptr.push(indices.len());
        }
        self.matrix = CsMat::new((keep.len(), self.n_features()), indptr, indices, data);
        self.barcodes = keep.iter().map(|&i| self.barcodes[i].clone()).collect();
        self.obs = self.obs.select_rows(keep);
        for coords in self.obsm.values_mut() {
            *coords = coords.select(ndarray::Axis(0), keep);
        }
        self.knn_cache.clear();
        self.corrected = None;
        Ok(())
    }

    /// Keep only the genes in `keep` (ascending). Only allowed while the
    /// matrix is `Raw`.
    pub fn subset_features(&mut self, keep: &[usize]) -> Result<()> {
        if self.state != MatrixState::Raw {
            bail!(
                "cannot remove genes from a {} matrix; gene order is fixed after filtering",
                self.state
            );
        }
        ensure!(
            keep.windows(2).all(|w| w[0] < w[1]),
            "gene indices must be strictly ascending"
        );
        let mut new_index = vec![None; self.n_features()];
        for (p, &j) in keep.iter().enumerate() {
            new_index[j] = Some(p);
        }
        let mut indptr = Vec::with_capacity(self.n_cells() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for row in self.matrix.outer_iterator() {
            for (j, &v) in row.iter() {
                if let Some(p) = new_index[j] {
                    indices.push(p);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }
        self.matrix = CsMat::new((self.n_cells(), keep.len()), indptr, indices, data);
        self.feature_names = keep.iter().map(|&j| self.feature_names[j].clone()).collect();
        self.var = self.var.select_rows(keep);
        self.corrected = None;
        Ok(())
    }
}
