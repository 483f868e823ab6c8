//! End-to-end runs of the built-in pipeline on synthetic counts.

use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};
use rand_xoshiro::Xoshiro256PlusPlus;
use sc_ana::registry::StageKind;
use sc_ana::{run_pipeline, PipelineError, PipelineOptions, StageState};
use sc_types::{basis, Column, Dataset, MatrixState};
use std::collections::{HashMap, HashSet};

const POPULATIONS: usize = 3;
const CELLS_PER_POPULATION: usize = 60;
const GENES: usize = 90;

/// Counts of three populations, each over-expressing its own block of genes.
fn synthetic_counts() -> Dataset {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    let high = Poisson::new(30.0).unwrap();
    let low = Poisson::new(1.0).unwrap();
    let block = GENES / POPULATIONS;
    let n_cells = POPULATIONS * CELLS_PER_POPULATION;
    let dense = ndarray::Array2::from_shape_fn((n_cells, GENES), |(i, j)| {
        if j / block == i / CELLS_PER_POPULATION {
            high.sample(&mut rng)
        } else {
            low.sample(&mut rng)
        }
    });
    let barcodes = (0..n_cells).map(|i| format!("cell{i}-{}", 1 + i % 2)).collect();
    let features = (0..GENES).map(|j| format!("gene{j}")).collect();
    Dataset::from_dense(barcodes, features, dense.view()).unwrap()
}

fn small_data_options() -> PipelineOptions {
    PipelineOptions {
        min_genes: 10,
        min_umis: 50,
        n_pc: 10,
        knn_k: 15,
        hvf_ngenes: Some(60),
        ..PipelineOptions::default()
    }
}

fn population(barcode: &str) -> usize {
    let i: usize = barcode
        .trim_start_matches("cell")
        .split('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap();
    i / CELLS_PER_POPULATION
}

#[test]
fn test_leiden_recovers_populations() {
    let opts = PipelineOptions {
        leiden: true,
        umap: true,
        umap_k: 10,
        ..small_data_options()
    };
    let config = opts.resolve().unwrap();
    let mut ds = synthetic_counts();
    let report = run_pipeline(&config, &mut ds).unwrap();
    assert!(report.is_success(), "{:?}", report.failures());
    assert_eq!(
        report.executed(),
        vec![
            StageKind::Filter,
            StageKind::Normalize,
            StageKind::SelectHvf,
            StageKind::Pca,
            StageKind::Leiden,
            StageKind::Umap,
        ]
    );

    assert_eq!(ds.state(), MatrixState::Normalized);
    assert_eq!(ds.require_embedding(basis::PCA).unwrap().ncols(), 10);
    assert_eq!(ds.require_embedding(basis::UMAP).unwrap().ncols(), 2);
    assert!(ds.obs().contains("Channel"));

    let labels = ds.obs().require("leiden_labels").unwrap();
    let mut owner: HashMap<String, usize> = HashMap::new();
    for (i, barcode) in ds.barcodes().iter().enumerate() {
        let label = labels.value_str(i).into_owned();
        let p = population(barcode);
        assert_eq!(*owner.entry(label).or_insert(p), p, "cluster mixes populations");
    }
    let covered: HashSet<usize> = owner.values().copied().collect();
    assert_eq!(covered.len(), POPULATIONS);
}

#[test]
fn test_failed_stage_does_not_stop_the_run() {
    let opts = PipelineOptions {
        louvain: true,
        kbet: true,
        kbet_batch: Some("donor".into()),
        kbet_k: 10,
        ..small_data_options()
    };
    let config = opts.resolve().unwrap();
    let mut ds = synthetic_counts();
    let donors = vec!["d1".to_string(); ds.n_cells()];
    ds.obs_mut().insert("donor", Column::Str(donors)).unwrap();

    let report = run_pipeline(&config, &mut ds).unwrap();
    assert!(!report.is_success());
    assert!(matches!(report.state(StageKind::Kbet), StageState::Failed(_)));
    assert_eq!(report.state(StageKind::Louvain), &StageState::Done);
    assert_eq!(report.failures().len(), 1);
    assert!(ds.obs().contains("louvain_labels"));
    assert!(!ds.uns().contains_key("kBET_stat"));
}

#[test]
fn test_processed_input_without_basis_is_rejected_before_running() {
    let opts = PipelineOptions {
        processed: true,
        net_fle: true,
        ..PipelineOptions::default()
    };
    let config = opts.resolve().unwrap();
    let mut ds = synthetic_counts().with_state(MatrixState::Normalized);
    let err = run_pipeline(&config, &mut ds).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration { .. }));
    assert!(!ds.has_embedding("net_fle"));
    assert!(!ds.obs().contains("ds_selected"));
}

#[test]
fn test_processed_input_with_nothing_enabled() {
    let opts = PipelineOptions {
        processed: true,
        ..PipelineOptions::default()
    };
    let config = opts.resolve().unwrap();
    let mut ds = synthetic_counts().with_state(MatrixState::Normalized);
    let report = run_pipeline(&config, &mut ds).unwrap();
    assert!(report.plan.stages.is_empty());
    assert!(report.executed().is_empty());
    assert!(report.is_success());
    assert_eq!(ds.n_cells(), POPULATIONS * CELLS_PER_POPULATION);
}

#[test]
fn test_processed_input_with_precomputed_pca() {
    let opts = PipelineOptions {
        processed: true,
        louvain: true,
        knn_k: 15,
        ..PipelineOptions::default()
    };
    let config = opts.resolve().unwrap();
    let mut ds = synthetic_counts().with_state(MatrixState::Normalized);
    let n = ds.n_cells();
    let pca = ndarray::Array2::from_shape_fn((n, 3), |(i, j)| {
        let p = i / CELLS_PER_POPULATION;
        if j == p {
            10.0 + (i % 7) as f64 * 0.1
        } else {
            (i % 5) as f64 * 0.1
        }
    });
    ds.insert_embedding(basis::PCA, pca).unwrap();
    let report = run_pipeline(&config, &mut ds).unwrap();
    assert_eq!(report.executed(), vec![StageKind::Louvain]);
    assert!(report.is_success());
}

/// 500 cells over 200 genes, ten of them mitochondrial. Every 25th cell is
/// shallow and every 40th is mostly mitochondrial.
fn qc_counts() -> (Vec<String>, ndarray::Array2<f64>) {
    const N_CELLS: usize = 500;
    const N_GENES: usize = 200;
    const N_MITO: usize = 10;
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
    let block = (N_GENES - N_MITO) / 5;
    let dense = ndarray::Array2::from_shape_fn((N_CELLS, N_GENES), |(i, j)| {
        let scale = if i % 25 == 0 { 0.05 } else { 1.0 };
        let rate = if j < N_MITO {
            if i % 40 == 0 {
                60.0
            } else {
                0.5
            }
        } else if (j - N_MITO) / block == i / 100 {
            6.0
        } else {
            0.8
        };
        Poisson::new(rate * scale).unwrap().sample(&mut rng)
    });
    let features = (0..N_GENES)
        .map(|j| if j < N_MITO { format!("MT-{j}") } else { format!("gene{j}") })
        .collect();
    (features, dense)
}

#[test]
fn test_leiden_only_run_keeps_the_cells_passing_qc() {
    let opts = PipelineOptions {
        min_genes: 40,
        min_umis: 100,
        n_pc: 10,
        knn_k: 15,
        hvf_ngenes: Some(100),
        leiden: true,
        ..PipelineOptions::default()
    };
    let config = opts.resolve().unwrap();
    let (features, dense) = qc_counts();
    let n_cells = dense.nrows();
    let barcodes = (0..n_cells).map(|i| format!("qc{i}-1")).collect();
    let mut ds = Dataset::from_dense(barcodes, features.clone(), dense.view()).unwrap();

    let passes = |i: usize| {
        let row = dense.row(i);
        let genes = row.iter().filter(|&&v| v > 0.0).count() as u64;
        let umis: f64 = row.sum();
        let mito: f64 = row
            .iter()
            .zip(&features)
            .filter(|(_, f)| f.starts_with(&*opts.mito_prefix))
            .map(|(v, _)| v)
            .sum();
        let percent_mito = if umis > 0.0 { 100.0 * mito / umis } else { 0.0 };
        (opts.min_genes..opts.max_genes).contains(&genes)
            && umis >= opts.min_umis as f64
            && umis < opts.max_umis as f64
            && percent_mito < opts.percent_mito
    };
    let kept: Vec<usize> = (0..n_cells).filter(|&i| passes(i)).collect();
    let expressed = (0..dense.ncols())
        .filter(|&j| kept.iter().any(|&i| dense[[i, j]] > 0.0))
        .count();
    assert!(kept.len() < n_cells, "the thresholds should drop some cells");

    let report = run_pipeline(&config, &mut ds).unwrap();
    assert!(report.is_success(), "{:?}", report.failures());
    assert_eq!(
        report.executed(),
        vec![
            StageKind::Filter,
            StageKind::Normalize,
            StageKind::SelectHvf,
            StageKind::Pca,
            StageKind::Leiden,
        ]
    );
    assert_eq!(ds.n_cells(), kept.len());
    assert_eq!(ds.n_features(), expressed);
    let expected_barcodes: Vec<String> = kept.iter().map(|i| format!("qc{i}-1")).collect();
    assert_eq!(ds.barcodes(), expected_barcodes.as_slice());

    let labels = ds.obs().require("leiden_labels").unwrap();
    let distinct: HashSet<String> = (0..ds.n_cells())
        .map(|i| labels.value_str(i).into_owned())
        .collect();
    assert!(!distinct.is_empty() && distinct.len() <= n_cells);
    assert!(!ds.has_embedding(basis::UMAP));
}
