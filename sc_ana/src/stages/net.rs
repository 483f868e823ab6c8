//! Approximate embeddings: run the exact algorithm on a density-aware
//! down-sample, extrapolate to every cell with a regressor, then polish.

use super::embedding::fle_layout;
use super::{StageContext, DS_SELECTED};
use crate::config::{NetFleParams, NetTsneParams, NetUmapParams};
use crate::downsample::{down_sample_with_knn, DownsampledSubset};
use crate::errors::{DataError, ExternalProcessError};
use crate::layout::{ForceLayout, LayoutBudget};
use crate::neighbors::knn;
use crate::polish::{polish, FlePolisher, Polish, TsnePolisher, UmapPolisher};
use crate::regressor::{min_samples, RegressorModel, RegressorParams};
use crate::tsne::{effective_perplexity, neighbors_for_perplexity, tsne_embed, MAX_ITER};
use crate::umap::umap_embed;
use anyhow::{Context, Result};
use log::{info, warn};
use ndarray::{Array2, Axis};
use sc_types::{basis, Column, Dataset, KnnGraph};

/// Down-sampled cells and their coordinates in the input basis.
struct NetInput {
    subset: DownsampledSubset,
    /// Input coordinates of every cell.
    x: Array2<f64>,
    /// Input coordinates of the down-sampled cells.
    x_subset: Array2<f64>,
}

impl NetInput {
    /// Exact neighbor graph of the down-sampled cells.
    fn subset_knn(&self, k: usize, parallel: bool) -> Result<KnnGraph> {
        let m = self.x_subset.nrows();
        knn(self.x_subset.view(), k.clamp(1, m.saturating_sub(1).max(1)), parallel)
    }
}

fn down_sample(ctx: &StageContext<'_>, ds: &mut Dataset) -> Result<NetInput> {
    let net = &ctx.config.net;
    let density = ctx.neighbors(ds, basis::PCA, net.k)?;
    let subset = down_sample_with_knn(&density, net.fraction, net.alpha, ctx.seed())?;
    let x = ds.require_embedding(ctx.basis())?.clone();
    let needed = min_samples(x.ncols());
    if subset.len() < needed {
        return Err(DataError::new(format!(
            "down-sampled {} of {} cells, the regressor needs at least {needed}",
            subset.len(),
            ds.n_cells()
        ))
        .into());
    }
    info!(
        "down-sampled {} of {} cells on {}",
        subset.len(),
        ds.n_cells(),
        ctx.basis()
    );
    let mask = subset.mask(ds.n_cells());
    ds.obs_mut().insert(DS_SELECTED, Column::Bool(mask))?;
    let x_subset = x.select(Axis(0), &subset.indices);
    Ok(NetInput { subset, x, x_subset })
}

/// Predict every cell from the exact embedding of the down-sample; the
/// down-sampled rows keep their exact coordinates.
fn extrapolate(ctx: &StageContext<'_>, input: &NetInput, y_subset: &Array2<f64>) -> Result<Array2<f64>> {
    let params = RegressorParams::new(ctx.config.net.l2_penalty, ctx.seed());
    let model = RegressorModel::fit(input.x_subset.view(), y_subset.view(), &params)
        .context("training the embedding regressor")?;
    let mut y = model.predict(input.x.view())?;
    for (row, &i) in input.subset.indices.iter().enumerate() {
        y.row_mut(i).assign(&y_subset.row(row));
    }
    Ok(y)
}

/// Polish the prediction. An external layout process failure falls back to
/// the prediction unless polishing is required.
fn polish_or_keep(ctx: &StageContext<'_>, polisher: &dyn Polish, predicted: Array2<f64>) -> Result<Array2<f64>> {
    match polish(polisher, predicted.clone()) {
        Ok(y) => Ok(y),
        Err(e)
            if !ctx.config.net.require_polish
                && e.chain().any(|c| c.is::<ExternalProcessError>()) =>
        {
            warn!("{}: polishing failed, keeping the predicted layout: {e:#}", ctx.stage.kind);
            Ok(predicted)
        }
        Err(e) => Err(e),
    }
}

pub fn run_net_tsne(ctx: &StageContext<'_>, ds: &mut Dataset, params: &NetTsneParams) -> Result<()> {
    let input = down_sample(ctx, ds)?;
    let y_subset = tsne_embed(input.x_subset.view(), params.perplexity, MAX_ITER, ctx.seed())
        .context("t-SNE of the down-sampled cells")?;
    let predicted = extrapolate(ctx, &input, &y_subset)?;

    let n = ds.n_cells();
    let perplexity = effective_perplexity(n, params.perplexity);
    let graph = ctx.neighbors(ds, ctx.basis(), neighbors_for_perplexity(n, perplexity))?;
    let polisher = TsnePolisher::new(&graph, perplexity, params.polish_learning_frac, params.polish_n_iter);
    let y = polish_or_keep(ctx, &polisher, predicted)?;
    ds.insert_embedding(params.out_basis.as_str(), y)?;
    Ok(())
}

pub fn run_net_umap(ctx: &StageContext<'_>, ds: &mut Dataset, params: &NetUmapParams) -> Result<()> {
    let umap = &params.umap;
    let input = down_sample(ctx, ds)?;
    let y_subset = umap_embed(
        input.x_subset.view(),
        umap.k,
        umap.min_dist,
        umap.spread,
        ctx.seed(),
        ctx.config.threads,
    )
    .context("umap of the down-sampled cells")?;
    let predicted = extrapolate(ctx, &input, &y_subset)?;

    let graph = ctx.neighbors(ds, ctx.basis(), umap.k.saturating_sub(1))?;
    let polisher = UmapPolisher::new(
        &graph,
        umap.min_dist,
        umap.spread,
        params.polish_learning_rate,
        params.polish_n_epochs,
        ctx.seed(),
    );
    let y = polish_or_keep(ctx, &polisher, predicted)?;
    ds.insert_embedding(params.out_basis.as_str(), y)?;
    Ok(())
}

pub fn run_net_fle(
    ctx: &StageContext<'_>,
    ds: &mut Dataset,
    params: &NetFleParams,
    service: &dyn ForceLayout,
) -> Result<()> {
    let fle = &params.fle;
    let memory_gb = ctx.config.layout.memory_gb;
    let input = down_sample(ctx, ds)?;
    let subset_graph = input.subset_knn(fle.k, ctx.config.knn.full_speed)?;
    let y_subset = fle_layout(&subset_graph, fle, memory_gb, service, ctx.seed())
        .context("force-directed layout of the down-sampled cells")?;
    let predicted = extrapolate(ctx, &input, &y_subset)?;

    let graph = ctx.neighbors(ds, ctx.basis(), fle.k)?;
    let budget = LayoutBudget {
        target_steps: params.polish_target_steps,
        target_change_per_node: fle.target_change_per_node,
        memory_gb,
    };
    let polisher = FlePolisher::new(service, &graph, budget);
    let y = polish_or_keep(ctx, &polisher, predicted)?;
    ds.insert_embedding(params.out_basis.as_str(), y)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FleParams, UmapParams};
    use crate::layout::{ForceAtlas2, LayoutGraph};
    use crate::registry::StageKind;
    use crate::stages::testing;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lays out the first graph it sees, then times out.
    struct FailsSecondCall {
        calls: AtomicUsize,
    }

    impl ForceLayout for FailsSecondCall {
        fn layout(&self, graph: &LayoutGraph, init: Array2<f64>, budget: &LayoutBudget) -> Result<Array2<f64>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                ForceAtlas2::default().layout(graph, init, budget)
            } else {
                Err(ExternalProcessError::Timeout {
                    command: "layout".into(),
                    secs: 1,
                }
                .into())
            }
        }
    }

    fn fle_params() -> NetFleParams {
        NetFleParams {
            fle: FleParams {
                k: 5,
                target_change_per_node: 2.0,
                target_steps: 100,
            },
            polish_target_steps: 50,
            out_basis: "net_fle".into(),
        }
    }

    #[test]
    fn test_net_umap_covers_every_cell() {
        let mut config = testing::config();
        config.net.fraction = 0.5;
        config.net.k = 5;
        let stage = testing::planned(StageKind::NetUmap, None);
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        let mut ds = testing::blobs(2, 30);
        let params = NetUmapParams {
            umap: UmapParams {
                k: 6,
                min_dist: 0.5,
                spread: 1.0,
            },
            polish_learning_rate: 1.0,
            polish_n_epochs: 10,
            out_basis: "net_umap".into(),
        };
        run_net_umap(&ctx, &mut ds, &params).unwrap();
        let y = ds.embedding("net_umap").unwrap();
        assert_eq!(y.dim(), (60, 2));
        assert!(y.iter().all(|v| v.is_finite()));
        match ds.obs().get(DS_SELECTED) {
            Some(Column::Bool(mask)) => assert_eq!(mask.iter().filter(|&&m| m).count(), 30),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_too_few_cells_to_train() {
        let mut config = testing::config();
        config.net.fraction = 0.1;
        let stage = testing::planned(StageKind::NetTsne, None);
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        let mut ds = testing::blobs(2, 20);
        let params = NetTsneParams {
            perplexity: 30.0,
            polish_learning_frac: 0.33,
            polish_n_iter: 10,
            out_basis: "net_tsne".into(),
        };
        let err = run_net_tsne(&ctx, &mut ds, &params).unwrap_err();
        assert!(err.is::<DataError>());
        assert!(!ds.has_embedding("net_tsne"));
    }

    #[test]
    fn test_failed_polish_keeps_prediction_unless_required() {
        let mut config = testing::config();
        config.net.fraction = 0.5;
        config.net.k = 5;
        let stage = testing::planned(StageKind::NetFle, Some(basis::PCA));
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        let mut ds = testing::blobs(2, 30);
        let service = FailsSecondCall {
            calls: AtomicUsize::new(0),
        };
        run_net_fle(&ctx, &mut ds, &fle_params(), &service).unwrap();
        assert_eq!(ds.embedding("net_fle").unwrap().dim(), (60, 2));

        config.net.require_polish = true;
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        let mut ds = testing::blobs(2, 30);
        let service = FailsSecondCall {
            calls: AtomicUsize::new(0),
        };
        let err = run_net_fle(&ctx, &mut ds, &fle_params(), &service).unwrap_err();
        assert!(err.chain().any(|c| c.is::<ExternalProcessError>()));
        assert!(!ds.has_embedding("net_fle"));
    }
}
