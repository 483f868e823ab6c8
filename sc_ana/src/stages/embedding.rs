//! Exact 2D visualization embeddings

use super::StageContext;
use crate::config::{FleParams, TsneParams, UmapParams};
use crate::layout::{self, ForceLayout, LayoutBudget, LayoutGraph};
use crate::tsne::{tsne_embed, MAX_ITER};
use crate::umap::umap_embed;
use anyhow::{Context, Result};
use log::info;
use ndarray::Array2;
use sc_types::{basis, Dataset, KnnGraph};

/// Force-directed layout of a neighbor graph from a random start.
pub fn fle_layout(
    graph: &KnnGraph,
    params: &FleParams,
    memory_gb: usize,
    service: &dyn ForceLayout,
    seed: u64,
) -> Result<Array2<f64>> {
    let graph = LayoutGraph::from_knn(graph);
    let init = layout::random_init(graph.n_nodes, seed);
    let budget = LayoutBudget {
        target_steps: params.target_steps,
        target_change_per_node: params.target_change_per_node,
        memory_gb,
    };
    service.layout(&graph, init, &budget)
}

pub fn run_tsne(ctx: &StageContext<'_>, ds: &mut Dataset, params: &TsneParams, out_basis: &'static str) -> Result<()> {
    let coords = ds.require_embedding(basis::PCA)?;
    info!("{out_basis} of {} cells, perplexity {}", coords.nrows(), params.perplexity);
    let y = tsne_embed(coords.view(), params.perplexity, MAX_ITER, ctx.seed())
        .with_context(|| out_basis.to_string())?;
    ds.insert_embedding(out_basis, y)?;
    Ok(())
}

pub fn run_umap(ctx: &StageContext<'_>, ds: &mut Dataset, params: &UmapParams) -> Result<()> {
    let coords = ds.require_embedding(basis::PCA)?;
    info!(
        "umap of {} cells, {} neighbors, min_dist {}, spread {}",
        coords.nrows(),
        params.k,
        params.min_dist,
        params.spread
    );
    let y = umap_embed(
        coords.view(),
        params.k,
        params.min_dist,
        params.spread,
        ctx.seed(),
        ctx.config.threads,
    )
    .context("umap")?;
    ds.insert_embedding(basis::UMAP, y)?;
    Ok(())
}

pub fn run_fle(ctx: &StageContext<'_>, ds: &mut Dataset, params: &FleParams, service: &dyn ForceLayout) -> Result<()> {
    let on = ctx.basis();
    let graph = ctx.neighbors(ds, on, params.k)?;
    info!("force-directed layout of {} cells on {on}", graph.n_cells());
    let y = fle_layout(&graph, params, ctx.config.layout.memory_gb, service, ctx.seed())
        .context("force-directed layout")?;
    ds.insert_embedding(basis::FLE, y)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ForceAtlas2;
    use crate::registry::StageKind;
    use crate::stages::testing;

    #[test]
    fn test_umap_and_fle_write_their_bases() {
        let config = testing::config();
        let mut ds = testing::blobs(2, 15);

        let stage = testing::planned(StageKind::Umap, None);
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        let params = UmapParams {
            k: 6,
            min_dist: 0.5,
            spread: 1.0,
        };
        run_umap(&ctx, &mut ds, &params).unwrap();
        let umap = ds.embedding(basis::UMAP).unwrap();
        assert_eq!(umap.dim(), (30, 2));
        assert!(umap.iter().all(|v| v.is_finite()));

        let stage = testing::planned(StageKind::Fle, Some(basis::PCA));
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        let params = FleParams {
            k: 5,
            target_change_per_node: 2.0,
            target_steps: 200,
        };
        run_fle(&ctx, &mut ds, &params, &ForceAtlas2::default()).unwrap();
        assert_eq!(ds.embedding(basis::FLE).unwrap().dim(), (30, 2));
    }

    #[test]
    fn test_tsne_on_few_cells() {
        let config = testing::config();
        let mut ds = testing::blobs(2, 5);
        let stage = testing::planned(StageKind::Tsne, None);
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        run_tsne(&ctx, &mut ds, &TsneParams { perplexity: 30.0 }, basis::TSNE).unwrap();
        assert_eq!(ds.embedding(basis::TSNE).unwrap().dim(), (10, 2));
    }
}
