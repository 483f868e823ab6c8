//! sc_types
//!
//! In-memory data model shared by the analysis stages: the cell-by-gene
//! [`Dataset`], its cell and gene [`MetadataTable`]s, the embedding registry
//! and cached nearest-neighbor graphs.
#![deny(missing_docs)]

mod dataset;
mod knn;
mod metadata;

pub use dataset::{CorrectedLayer, Dataset, MatrixState, UnsValue};
pub use knn::KnnGraph;
pub use metadata::{Column, MetadataTable};

/// Well-known basis names in the embedding registry.
pub mod basis {
    /// Principal components.
    pub const PCA: &str = "pca";
    /// Diffusion components.
    pub const DIFFMAP: &str = "diffmap";
    /// Diffusion components projected to 3D.
    pub const DIFFMAP_PCA: &str = "diffmap_pca";
    /// Exact t-SNE.
    pub const TSNE: &str = "tsne";
    /// FIt-SNE.
    pub const FITSNE: &str = "fitsne";
    /// UMAP.
    pub const UMAP: &str = "umap";
    /// Force-directed layout.
    pub const FLE: &str = "fle";
}
