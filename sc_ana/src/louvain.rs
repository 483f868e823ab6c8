//! high-level louvain and leiden on neighbor graphs

use itertools::Itertools;
use leiden::clustering::{Clustering, SimpleClustering};
use leiden::leiden::Leiden;
use leiden::louvain::Louvain;
use leiden::objective::cpm;
use leiden::Network;
use log::info;
use sc_types::KnnGraph;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Instant;

const TOLERANCE: f64 = 1e-6;
const MAX_ITERATIONS: usize = 1000;
/// Randomness of the leiden refinement step.
const LEIDEN_RANDOMNESS: f64 = 0.01;

/// Network over the directed neighbor relations of `graph`, plus the
/// starting partition: `init` when it labels every cell, singletons
/// otherwise.
fn build_network(graph: &KnnGraph, init: Option<&[usize]>) -> (Network, SimpleClustering) {
    let n_nodes = graph.n_cells();
    let n_edges = n_nodes * graph.k();
    info!(
        "building network for neighbor matrix of shape: ({},{})",
        n_nodes,
        graph.k()
    );
    let adjacency = (0..n_nodes)
        .flat_map(|i| graph.neighbors(i).iter().map(move |&j| (i as u32, j as u32)).collect_vec());
    let network = Louvain::build_network(n_nodes, n_edges, adjacency);
    let clustering: SimpleClustering = match init {
        Some(labels) if labels.len() == n_nodes => Clustering::new_from_labels(labels),
        _ => Clustering::init_different_clusters(n_nodes),
    };
    (network, clustering)
}

fn labels_of(clustering: &SimpleClustering, n_nodes: usize) -> Vec<usize> {
    (0..n_nodes).map(|i| clustering.get(i)).collect()
}

/// Relabel clusters by descending size, starting at 1. Ties keep the order
/// of the original labels.
pub fn relabel_by_size(labels: &[usize]) -> Vec<usize> {
    let order: HashMap<usize, usize> = labels
        .iter()
        .counts()
        .into_iter()
        .sorted_by_key(|&(label, count)| (Reverse(count), *label))
        .enumerate()
        .map(|(rank, (label, _))| (*label, rank + 1))
        .collect();
    labels.iter().map(|l| order[l]).collect()
}

/// Louvain clustering, repeated until the quality stops improving. Returns
/// labels relabelled by size, starting at 1.
pub fn run_louvain(graph: &KnnGraph, resolution: f64, init: Option<&[usize]>, seed: u64) -> Vec<usize> {
    let n_nodes = graph.n_cells();
    let (network, mut clustering) = build_network(graph, init);
    let mut louvain = Louvain::new(resolution, Some(seed as usize));

    let mut score = cpm(resolution, &network, &clustering);
    info!("louvain starting cpm score: {score:.6}");
    let now = Instant::now();
    for i in 0..MAX_ITERATIONS {
        let updated = louvain.iterate_one_level(&network, &mut clustering);
        info!("  iteration {i}");
        let new_score = cpm(resolution, &network, &clustering);
        info!("    cpm score: {new_score:.6}");
        if !updated || (new_score - score).abs() <= TOLERANCE {
            info!("louvain optimized in {} iterations", i + 1);
            info!("louvain final cpm score: {new_score:.6}");
            break;
        }
        score = new_score;
    }
    info!("optimization time: {:.2?}", now.elapsed());
    relabel_by_size(&labels_of(&clustering, n_nodes))
}

/// Leiden clustering. `n_iter = None` iterates until the partition is
/// stable. Returns labels relabelled by size, starting at 1.
pub fn run_leiden(
    graph: &KnnGraph,
    resolution: f64,
    n_iter: Option<usize>,
    init: Option<&[usize]>,
    seed: u64,
) -> Vec<usize> {
    let n_nodes = graph.n_cells();
    let (network, mut clustering) = build_network(graph, init);
    let mut leiden = Leiden::new(resolution, LEIDEN_RANDOMNESS, Some(seed as usize));

    let mut score = cpm(resolution, &network, &clustering);
    info!("leiden starting cpm score: {score:.6}");
    let now = Instant::now();
    let max_iterations = n_iter.unwrap_or(MAX_ITERATIONS);
    for i in 0..max_iterations {
        let updated = leiden.iterate(&network, &mut clustering);
        info!("  iteration {i}: {} clusters", clustering.num_clusters());
        let new_score = cpm(resolution, &network, &clustering);
        info!("    cpm score: {new_score:.6}");
        let converged = !updated || (n_iter.is_none() && (new_score - score).abs() <= TOLERANCE);
        if converged || i + 1 == max_iterations {
            info!("leiden stopped after {} iterations", i + 1);
            info!("leiden final cpm score: {new_score:.6}");
            break;
        }
        score = new_score;
    }
    info!("optimization time: {:.2?}", now.elapsed());
    relabel_by_size(&labels_of(&clustering, n_nodes))
}
