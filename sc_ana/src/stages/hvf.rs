//! Highly variable feature selection

use super::{column_mean_var, flagged_features, HIGHLY_VARIABLE, ROBUST};
use crate::config::{HvfFlavor, HvfParams};
use crate::errors::DataError;
use anyhow::Result;
use log::info;
use ndarray::{Array, Array1};
use ndarray_stats::interpolate::Linear;
use ndarray_stats::Quantile1dExt;
use noisy_float::types::{n64, N64};
use sc_types::{Column, Dataset};
use std::cmp::Ordering;

const DISPERSION_BINS: usize = 20;
// Seurat flavor without a feature count keeps genes above this normalized dispersion
const MIN_NORMALIZED_DISPERSION: f64 = 0.5;

fn median(values: Vec<N64>) -> f64 {
    Array1::from(values)
        .quantile_mut(n64(0.5), &Linear)
        .map_or(f64::NAN, N64::raw)
}

fn binned_median(binned: &Array1<f64>, values: &Array1<f64>, bin_edges: &[N64]) -> (Array1<f64>, Vec<usize>) {
    let max_index = bin_edges.len() - 1;
    let mut bin_indices = Vec::with_capacity(values.len());
    let mut binned_values = vec![Vec::new(); max_index];
    for (i, &v) in binned.iter().enumerate() {
        let idx = match bin_edges[1..max_index].binary_search(&n64(v)) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        bin_indices.push(idx);
        binned_values[idx].push(n64(values[i]));
    }
    let medians = binned_values.into_iter().map(median).collect();
    (medians, bin_indices)
}

fn quantile_edges(mean: &Array1<f64>) -> Vec<N64> {
    let qs = Array::linspace(0.0, 1.0, DISPERSION_BINS + 1).mapv(n64);
    let mut edges = mean
        .mapv(n64)
        .quantiles_mut(&qs, &Linear)
        .map(ndarray::ArrayBase::into_raw_vec)
        .unwrap_or_default();
    edges.dedup();
    edges
}

/// Median of `values` within the mean-expression bin of every gene, or
/// `None` if all genes fall into one bin.
fn binned_trend(mean: &Array1<f64>, values: &Array1<f64>) -> Option<Array1<f64>> {
    let edges = quantile_edges(mean);
    if edges.len() <= 1 {
        return None;
    }
    let (medians, bin_indices) = binned_median(mean, values, &edges);
    Some(bin_indices.into_iter().map(|i| medians[i]).collect())
}

/// Variance residual against the binned mean-variance trend of log data.
pub fn variance_residual(mean: &Array1<f64>, var: &Array1<f64>) -> Array1<f64> {
    match binned_trend(mean, var) {
        Some(trend) => var - &trend,
        None => var - var.mean().unwrap_or(0.0),
    }
}

/// Dispersion of count-scale expression, centered by the binned median and
/// scaled by the binned median absolute deviation.
pub fn normalized_dispersion(mean: &Array1<f64>, var: &Array1<f64>) -> Array1<f64> {
    let dispersion = (var - mean) / mean.mapv(|v| v * v);
    let Some(medians) = binned_trend(mean, &dispersion) else {
        return dispersion;
    };
    let deviations = (&dispersion - &medians).mapv_into(f64::abs);
    let Some(mads) = binned_trend(mean, &deviations) else {
        return dispersion;
    };
    (&dispersion - &medians) / &mads
}

/// Candidates ordered by descending score, non-finite scores last, ties by index.
fn rank(scores: &Array1<f64>, candidates: &[usize]) -> Vec<usize> {
    let mut order = candidates.to_vec();
    order.sort_by(|&a, &b| {
        let (da, db) = (scores[a], scores[b]);
        match (da.is_finite(), db.is_finite()) {
            (true, true) => db.total_cmp(&da),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => Ordering::Equal,
        }
        .then(a.cmp(&b))
    });
    order
}

pub fn run(ds: &mut Dataset, params: &HvfParams) -> Result<()> {
    let candidates = flagged_features(ds, ROBUST);
    if candidates.is_empty() {
        return Err(DataError::new("no robust gene to select features from").into());
    }
    let (scores, selected) = match params.flavor {
        HvfFlavor::Sccloud => {
            let (mean, var) = column_mean_var(ds.matrix(), |v| v);
            let sub = |a: &Array1<f64>| candidates.iter().map(|&j| a[j]).collect::<Array1<f64>>();
            let residual = variance_residual(&sub(&mean), &sub(&var));
            let mut scores = Array1::from_elem(ds.n_features(), f64::NAN);
            for (&j, &r) in candidates.iter().zip(residual.iter()) {
                scores[j] = r;
            }
            let n = params.n_genes.unwrap_or(candidates.len());
            let mut selected = rank(&scores, &candidates);
            selected.truncate(n);
            (scores, selected)
        }
        HvfFlavor::Seurat => {
            let (mean, var) = column_mean_var(ds.matrix(), f64::exp_m1);
            let expressed: Vec<usize> = candidates.iter().copied().filter(|&j| mean[j] > 0.0).collect();
            let sub = |a: &Array1<f64>| expressed.iter().map(|&j| a[j]).collect::<Array1<f64>>();
            let dispersion = normalized_dispersion(&sub(&mean), &sub(&var));
            let mut scores = Array1::from_elem(ds.n_features(), f64::NAN);
            for (&j, &d) in expressed.iter().zip(dispersion.iter()) {
                scores[j] = d;
            }
            let ranked = rank(&scores, &expressed);
            let selected = match params.n_genes {
                Some(n) => ranked.into_iter().take(n).collect(),
                None => ranked
                    .into_iter()
                    .filter(|&j| scores[j] > MIN_NORMALIZED_DISPERSION)
                    .collect(),
            };
            (scores, selected)
        }
    };

    let mut flags = vec![false; ds.n_features()];
    for &j in &selected {
        flags[j] = true;
    }
    info!(
        "selected {} highly variable features ({} flavor) out of {} robust genes",
        selected.len(),
        params.flavor,
        candidates.len()
    );
    let var = ds.var_mut();
    var.insert("hvf_score", Column::Float(scores.to_vec()))?;
    var.insert(HIGHLY_VARIABLE, Column::Bool(flags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_types::MatrixState;

    fn normalized(n_cells: usize, n_genes: usize) -> Dataset {
        // gene j alternates between 0 and a level growing with j; gene 0 is constant
        let dense = ndarray::Array2::from_shape_fn((n_cells, n_genes), |(i, j)| {
            if j == 0 {
                1.0
            } else if (i + j) % 2 == 0 {
                (j as f64 * 0.3).ln_1p()
            } else {
                0.1
            }
        });
        let mut ds = Dataset::from_dense(
            (0..n_cells).map(|i| format!("c{i}")).collect(),
            (0..n_genes).map(|j| format!("g{j}")).collect(),
            dense.view(),
        )
        .unwrap();
        ds.set_state(MatrixState::Normalized).unwrap();
        ds
    }

    fn selected(ds: &Dataset) -> Vec<usize> {
        flagged_features(ds, HIGHLY_VARIABLE)
    }

    #[test]
    fn test_rank_puts_nan_last() {
        let scores = Array1::from(vec![1.0, f64::NAN, 3.0, 1.0]);
        assert_eq!(rank(&scores, &[0, 1, 2, 3]), vec![2, 0, 3, 1]);
    }

    #[test]
    fn test_sccloud_selects_requested_count() {
        let mut ds = normalized(40, 30);
        run(
            &mut ds,
            &HvfParams {
                flavor: HvfFlavor::Sccloud,
                n_genes: Some(5),
            },
        )
        .unwrap();
        let chosen = selected(&ds);
        assert_eq!(chosen.len(), 5);
        assert!(!chosen.contains(&0));
    }

    #[test]
    fn test_only_robust_genes_are_candidates() {
        let mut ds = normalized(40, 30);
        let robust = (0..30).map(|j| j < 10).collect();
        ds.var_mut().insert(ROBUST, Column::Bool(robust)).unwrap();
        run(
            &mut ds,
            &HvfParams {
                flavor: HvfFlavor::Sccloud,
                n_genes: Some(50),
            },
        )
        .unwrap();
        assert_eq!(selected(&ds), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_seurat_threshold_mode() {
        let mut ds = normalized(40, 60);
        run(
            &mut ds,
            &HvfParams {
                flavor: HvfFlavor::Seurat,
                n_genes: None,
            },
        )
        .unwrap();
        let scores = match ds.var().get("hvf_score") {
            Some(Column::Float(s)) => s.clone(),
            other => panic!("unexpected {other:?}"),
        };
        for j in selected(&ds) {
            assert!(scores[j] > MIN_NORMALIZED_DISPERSION);
        }
    }
}
