//! Built-in stage bodies and the executor that dispatches to them

pub mod batch;
pub mod clustering;
pub mod diffmap;
pub mod embedding;
pub mod filter;
pub mod hvf;
pub mod kbet;
pub mod net;
pub mod normalize;
pub mod pca;
pub mod pseudotime;

use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::layout::{layout_service, ForceLayout};
use crate::neighbors::knn;
use crate::orchestrator::{PlannedStage, StageExecutor};
use crate::registry::StageKind;
use anyhow::{Context, Result};
use log::debug;
use ndarray::Array1;
use sc_types::{basis, Dataset, KnnGraph};
use sprs::CsMat;

/// Name of the gene column marking the selected features.
pub const HIGHLY_VARIABLE: &str = "highly_variable_features";
/// Name of the gene column marking genes expressed in enough cells.
pub const ROBUST: &str = "robust";
/// Cell column written by the net-embedding stages.
pub const DS_SELECTED: &str = "ds_selected";

/// Seed of one stage: independent of which other stages run.
pub fn stage_seed(seed: u64, stage: &str) -> u64 {
    seed ^ fxhash::hash64(stage)
}

/// What a stage body needs besides the dataset.
pub struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    pub stage: &'a PlannedStage,
}

impl StageContext<'_> {
    pub fn seed(&self) -> u64 {
        stage_seed(self.config.seed, self.stage.kind.name())
    }

    /// Basis resolved by the planner, `pca` for stages without a choice.
    pub fn basis(&self) -> &'static str {
        self.stage.basis.unwrap_or(basis::PCA)
    }

    /// Neighbor graph on `basis`, computed once per basis and `k`.
    pub fn neighbors(&self, ds: &mut Dataset, basis: &str, k: usize) -> Result<KnnGraph> {
        let coords = ds.require_embedding(basis)?;
        let k = k.clamp(1, coords.nrows().saturating_sub(1).max(1));
        if let Some(graph) = ds.cached_knn(basis, k) {
            return Ok(graph.clone());
        }
        debug!("computing {k} nearest neighbors on {basis}");
        let graph = knn(coords.view(), k, self.config.knn.full_speed)
            .with_context(|| format!("neighbor graph on {basis}"))?;
        ds.cache_knn(basis, graph.clone());
        Ok(graph)
    }

    fn missing(&self) -> PipelineError {
        PipelineError::configuration(self.stage.kind.name(), "stage is planned but not configured")
    }
}

/// Indices of the genes flagged in a boolean gene column, or every gene if
/// the column is absent.
pub fn flagged_features(ds: &Dataset, column: &str) -> Vec<usize> {
    match ds.var().get(column) {
        Some(sc_types::Column::Bool(flags)) => flags
            .iter()
            .enumerate()
            .filter_map(|(j, &f)| f.then_some(j))
            .collect(),
        _ => (0..ds.n_features()).collect(),
    }
}

/// Per-gene mean and variance (ddof 1) of `transform` applied to every
/// entry of a CSR matrix, zeros included.
pub fn column_mean_var(matrix: &CsMat<f64>, transform: impl Fn(f64) -> f64) -> (Array1<f64>, Array1<f64>) {
    let (n, m) = matrix.shape();
    let zero = transform(0.0);
    let mut sum = Array1::<f64>::zeros(m);
    let mut sum_sq = Array1::<f64>::zeros(m);
    let mut nnz = vec![0usize; m];
    for row in matrix.outer_iterator() {
        for (j, &v) in row.iter() {
            let t = transform(v);
            sum[j] += t;
            sum_sq[j] += t * t;
            nnz[j] += 1;
        }
    }
    let n_f = n as f64;
    let mut mean = Array1::zeros(m);
    let mut var = Array1::zeros(m);
    for j in 0..m {
        let zeros = (n - nnz[j]) as f64;
        let s = sum[j] + zeros * zero;
        let s2 = sum_sq[j] + zeros * zero * zero;
        mean[j] = s / n_f.max(1.0);
        var[j] = if n > 1 {
            ((s2 - s * s / n_f) / (n_f - 1.0)).max(0.0)
        } else {
            0.0
        };
    }
    (mean, var)
}

/// Runs the built-in stage bodies.
pub struct BuiltinStages<'a> {
    config: &'a PipelineConfig,
    layout: Box<dyn ForceLayout>,
}

impl<'a> BuiltinStages<'a> {
    pub fn new(config: &'a PipelineConfig) -> Result<Self, PipelineError> {
        let layout = layout_service(&config.layout).map_err(|e| PipelineError::configuration("fle", format!("{e:#}")))?;
        Ok(BuiltinStages { config, layout })
    }
}

impl StageExecutor for BuiltinStages<'_> {
    fn run(&mut self, stage: &PlannedStage, ds: &mut Dataset) -> Result<()> {
        let ctx = StageContext {
            config: self.config,
            stage,
        };
        let c = self.config;
        match stage.kind {
            StageKind::Filter => filter::run(ds, c.filter.as_ref().ok_or_else(|| ctx.missing())?),
            StageKind::Normalize => {
                normalize::run(ds, c.normalize.as_ref().ok_or_else(|| ctx.missing())?)
            }
            StageKind::SelectHvf => hvf::run(ds, c.hvf.as_ref().ok_or_else(|| ctx.missing())?),
            StageKind::CorrectBatch => {
                batch::run(ds, c.batch.as_ref().ok_or_else(|| ctx.missing())?)
            }
            StageKind::Pca => pca::run(&ctx, ds, c.pca.as_ref().ok_or_else(|| ctx.missing())?),
            StageKind::Diffmap => {
                diffmap::run(&ctx, ds, c.diffmap.as_ref().ok_or_else(|| ctx.missing())?)
            }
            StageKind::DiffmapTo3d => diffmap::run_to_3d(&ctx, ds),
            StageKind::Pseudotime => {
                pseudotime::run(ds, c.pseudotime.as_ref().ok_or_else(|| ctx.missing())?)
            }
            StageKind::Kbet => kbet::run(&ctx, ds, c.kbet.as_ref().ok_or_else(|| ctx.missing())?),
            StageKind::Louvain => {
                clustering::run_louvain(&ctx, ds, c.louvain.as_ref().ok_or_else(|| ctx.missing())?)
            }
            StageKind::Leiden => {
                clustering::run_leiden(&ctx, ds, c.leiden.as_ref().ok_or_else(|| ctx.missing())?)
            }
            StageKind::SpectralLouvain => clustering::run_spectral(
                &ctx,
                ds,
                c.spectral_louvain.as_ref().ok_or_else(|| ctx.missing())?,
                clustering::Method::Louvain,
            ),
            StageKind::SpectralLeiden => clustering::run_spectral(
                &ctx,
                ds,
                c.spectral_leiden.as_ref().ok_or_else(|| ctx.missing())?,
                clustering::Method::Leiden,
            ),
            StageKind::Tsne => embedding::run_tsne(
                &ctx,
                ds,
                c.tsne.as_ref().ok_or_else(|| ctx.missing())?,
                basis::TSNE,
            ),
            StageKind::Fitsne => embedding::run_tsne(
                &ctx,
                ds,
                c.fitsne.as_ref().ok_or_else(|| ctx.missing())?,
                basis::FITSNE,
            ),
            StageKind::Umap => {
                embedding::run_umap(&ctx, ds, c.umap.as_ref().ok_or_else(|| ctx.missing())?)
            }
            StageKind::Fle => embedding::run_fle(
                &ctx,
                ds,
                c.fle.as_ref().ok_or_else(|| ctx.missing())?,
                self.layout.as_ref(),
            ),
            StageKind::NetTsne => {
                net::run_net_tsne(&ctx, ds, c.net_tsne.as_ref().ok_or_else(|| ctx.missing())?)
            }
            StageKind::NetUmap => {
                net::run_net_umap(&ctx, ds, c.net_umap.as_ref().ok_or_else(|| ctx.missing())?)
            }
            StageKind::NetFle => net::run_net_fle(
                &ctx,
                ds,
                c.net_fle.as_ref().ok_or_else(|| ctx.missing())?,
                self.layout.as_ref(),
            ),
        }
    }
}
