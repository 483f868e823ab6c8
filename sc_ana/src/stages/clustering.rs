//! Graph clustering stages

use super::StageContext;
use crate::config::{ClusterParams, LeidenParams, SpectralParams};
use crate::kmeans::kmeans;
use crate::louvain;
use anyhow::{Context, Result};
use log::info;
use sc_types::{basis, Column, Dataset, KnnGraph};

/// Community detection algorithm run on the neighbor network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Louvain,
    Leiden,
}

fn network(ctx: &StageContext<'_>, ds: &mut Dataset) -> Result<KnnGraph> {
    ctx.neighbors(ds, basis::PCA, ctx.config.knn.k)
}

fn write_labels(ds: &mut Dataset, class_label: &str, labels: &[usize]) -> Result<()> {
    let n_clusters = labels.iter().copied().max().unwrap_or(0);
    info!("{class_label}: {n_clusters} clusters");
    let labels = labels.iter().map(usize::to_string).collect();
    ds.obs_mut().insert(class_label, Column::Str(labels))
}

pub fn run_louvain(ctx: &StageContext<'_>, ds: &mut Dataset, params: &ClusterParams) -> Result<()> {
    let net = network(ctx, ds)?;
    let labels = louvain::run_louvain(&net, params.resolution, None, ctx.seed());
    write_labels(ds, &params.class_label, &labels)
}

pub fn run_leiden(ctx: &StageContext<'_>, ds: &mut Dataset, params: &LeidenParams) -> Result<()> {
    let net = network(ctx, ds)?;
    let labels = louvain::run_leiden(&net, params.resolution, params.n_iter, None, ctx.seed());
    write_labels(ds, &params.class_label, &labels)
}

/// K-means on the stage's basis, then Louvain or Leiden refinement of the
/// k-means partition on the `pca` neighbor network.
pub fn run_spectral(
    ctx: &StageContext<'_>,
    ds: &mut Dataset,
    params: &SpectralParams,
    method: Method,
) -> Result<()> {
    let basis = ctx.basis();
    let coords = ds.require_embedding(basis)?;
    let fit = kmeans(coords.view(), params.n_clusters, params.n_init, ctx.seed())
        .with_context(|| format!("k-means on {basis}"))?;
    info!(
        "k-means on {basis} with {} clusters, inertia {:.4}",
        params.n_clusters, fit.inertia
    );
    let net = network(ctx, ds)?;
    let init = Some(fit.labels.as_slice());
    let labels = match method {
        Method::Louvain => louvain::run_louvain(&net, params.resolution, init, ctx.seed()),
        Method::Leiden => louvain::run_leiden(&net, params.resolution, None, init, ctx.seed()),
    };
    write_labels(ds, &params.class_label, &labels)
}
