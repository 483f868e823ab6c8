//! sc_ana
//!
//! Single-cell clustering pipeline: option handling, stage planning and
//! execution, and the analysis stages, including approximate embeddings that
//! extrapolate an exact embedding of a down-sample to every cell.

pub mod config;
pub mod downsample;
pub mod errors;
pub mod grouping;
pub mod io;
pub mod kmeans;
pub mod layout;
pub mod linalg;
pub mod louvain;
pub mod neighbors;
pub mod orchestrator;
pub mod pipeline;
pub mod polish;
pub mod registry;
pub mod regressor;
pub mod stages;
pub mod tsne;
pub mod umap;

pub use config::{PipelineConfig, PipelineOptions};
pub use errors::{DataError, ExternalProcessError, PipelineError};
pub use orchestrator::{Plan, RunReport, StageState};
pub use pipeline::{plan_pipeline, run_pipeline};
