//! Short refinement runs of an exact embedding algorithm, started from an
//! approximate layout of all cells.

use crate::errors::DataError;
use crate::layout::{ForceLayout, LayoutBudget, LayoutGraph};
use crate::tsne::{tsne_affinities, tsne_refine};
use crate::umap::{find_ab_params, fuzzy_simplicial_set, optimize_layout, FuzzyGraph, LayoutSgd};
use anyhow::{Context, Result};
use log::info;
use ndarray::Array2;
use sc_types::KnnGraph;
use sprs::CsMat;

/// One exact algorithm, run for a bounded number of iterations.
pub trait Polish {
    /// Algorithm name, for logging.
    fn name(&self) -> &'static str;

    /// Iteration budget; zero leaves the layout untouched.
    fn iterations(&self) -> usize;

    /// Refine `init` in place of a random start.
    fn refine(&self, init: Array2<f64>) -> Result<Array2<f64>>;
}

/// Refine `init` with `polisher`, checking that cells are neither dropped
/// nor reordered.
pub fn polish(polisher: &dyn Polish, init: Array2<f64>) -> Result<Array2<f64>> {
    if init.iter().any(|x| !x.is_finite()) {
        return Err(DataError::new("layout to polish contains non-finite values").into());
    }
    if polisher.iterations() == 0 {
        return Ok(init);
    }
    let shape = init.dim();
    info!(
        "polishing {} cells with {} iterations of {}",
        shape.0,
        polisher.iterations(),
        polisher.name()
    );
    let out = polisher
        .refine(init)
        .with_context(|| format!("polishing with {}", polisher.name()))?;
    if out.dim() != shape {
        return Err(DataError::new(format!(
            "{} returned a layout of shape {:?}, expected {shape:?}",
            polisher.name(),
            out.dim()
        ))
        .into());
    }
    Ok(out)
}

/// t-SNE without early exaggeration, learning rate scaled to the full cell count.
pub struct TsnePolisher {
    affinities: CsMat<f64>,
    learning_rate: f64,
    n_iter: usize,
}

impl TsnePolisher {
    pub fn new(graph: &KnnGraph, perplexity: f64, learning_frac: f64, n_iter: usize) -> Self {
        TsnePolisher {
            affinities: tsne_affinities(graph, perplexity),
            learning_rate: learning_frac * graph.n_cells() as f64,
            n_iter,
        }
    }
}

impl Polish for TsnePolisher {
    fn name(&self) -> &'static str {
        "t-SNE"
    }

    fn iterations(&self) -> usize {
        self.n_iter
    }

    fn refine(&self, mut init: Array2<f64>) -> Result<Array2<f64>> {
        tsne_refine(&mut init, &self.affinities, self.learning_rate, self.n_iter)?;
        Ok(init)
    }
}

/// UMAP SGD epochs over the fuzzy graph of all cells.
pub struct UmapPolisher {
    graph: FuzzyGraph,
    sgd: LayoutSgd,
}

impl UmapPolisher {
    pub fn new(
        graph: &KnnGraph,
        min_dist: f64,
        spread: f64,
        learning_rate: f64,
        n_epochs: usize,
        seed: u64,
    ) -> Self {
        let (a, b) = find_ab_params(spread, min_dist);
        UmapPolisher {
            graph: fuzzy_simplicial_set(graph),
            sgd: LayoutSgd {
                a,
                b,
                n_epochs,
                learning_rate,
                seed,
            },
        }
    }
}

impl Polish for UmapPolisher {
    fn name(&self) -> &'static str {
        "UMAP"
    }

    fn iterations(&self) -> usize {
        self.sgd.n_epochs
    }

    fn refine(&self, mut init: Array2<f64>) -> Result<Array2<f64>> {
        optimize_layout(&mut init, &self.graph, &self.sgd)?;
        Ok(init)
    }
}

/// Force-directed layout steps through the layout service.
pub struct FlePolisher<'a> {
    service: &'a dyn ForceLayout,
    graph: LayoutGraph,
    budget: LayoutBudget,
}

impl<'a> FlePolisher<'a> {
    pub fn new(service: &'a dyn ForceLayout, graph: &KnnGraph, budget: LayoutBudget) -> Self {
        FlePolisher {
            service,
            graph: LayoutGraph::from_knn(graph),
            budget,
        }
    }
}

impl Polish for FlePolisher<'_> {
    fn name(&self) -> &'static str {
        "force-directed layout"
    }

    fn iterations(&self) -> usize {
        self.budget.target_steps
    }

    fn refine(&self, init: Array2<f64>) -> Result<Array2<f64>> {
        self.service.layout(&self.graph, init, &self.budget)
    }
}
