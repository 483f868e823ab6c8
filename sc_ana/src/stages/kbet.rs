//! kBET: chi-square test of local against global batch composition

use super::StageContext;
use crate::config::KbetParams;
use crate::errors::DataError;
use anyhow::{Context, Result};
use log::info;
use rayon::prelude::*;
use sc_types::{basis, Dataset, KnnGraph, UnsValue};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KbetResult {
    pub stat: f64,
    pub pvalue: f64,
    pub accept_rate: f64,
}

/// Test every cell's neighborhood (the cell and its neighbors) against the
/// global frequency of each batch.
pub fn kbet(graph: &KnnGraph, batches: &[usize], n_batches: usize, alpha: f64) -> Result<KbetResult> {
    let n = graph.n_cells();
    let mut global = vec![0.0; n_batches];
    for &b in batches {
        global[b] += 1.0;
    }
    let size = (graph.k() + 1) as f64;
    let expected: Vec<f64> = global.iter().map(|&c| c / n as f64 * size).collect();
    let chi2 = ChiSquared::new((n_batches - 1) as f64).context("chi-square distribution")?;

    let tests: Vec<(f64, f64)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut observed = vec![0.0; n_batches];
            observed[batches[i]] += 1.0;
            for &j in graph.neighbors(i) {
                observed[batches[j]] += 1.0;
            }
            let stat: f64 = observed
                .iter()
                .zip(&expected)
                .map(|(o, e)| (o - e) * (o - e) / e)
                .sum();
            (stat, 1.0 - chi2.cdf(stat))
        })
        .collect();

    let n_f = n as f64;
    Ok(KbetResult {
        stat: tests.iter().map(|t| t.0).sum::<f64>() / n_f,
        pvalue: tests.iter().map(|t| t.1).sum::<f64>() / n_f,
        accept_rate: tests.iter().filter(|t| t.1 >= alpha).count() as f64 / n_f,
    })
}

pub fn run(ctx: &StageContext<'_>, ds: &mut Dataset, params: &KbetParams) -> Result<()> {
    let column = ds
        .obs()
        .get(&params.batch)
        .ok_or_else(|| DataError::new(format!("batch attribute '{}' does not exist", params.batch)))?;
    let mut ids: HashMap<String, usize> = HashMap::new();
    let batches: Vec<usize> = (0..ds.n_cells())
        .map(|i| {
            let next = ids.len();
            *ids.entry(column.value_str(i).into_owned()).or_insert(next)
        })
        .collect();
    if ids.len() < 2 {
        return Err(DataError::new(format!(
            "kBET needs at least two values of '{}', found {}",
            params.batch,
            ids.len()
        ))
        .into());
    }

    let graph = ctx.neighbors(ds, basis::PCA, params.k)?;
    let result = kbet(&graph, &batches, ids.len(), params.alpha)?;
    info!(
        "kBET on '{}' with {} batches: stat {:.4}, p-value {:.4}, accept rate {:.4}",
        params.batch,
        ids.len(),
        result.stat,
        result.pvalue,
        result.accept_rate
    );
    ds.set_uns("kBET_stat", UnsValue::Float(result.stat));
    ds.set_uns("kBET_pvalue", UnsValue::Float(result.pvalue));
    ds.set_uns("kBET_accept_rate", UnsValue::Float(result.accept_rate));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StageKind;
    use crate::stages::testing;
    use sc_types::Column;

    fn accept_rate(batch_of: impl Fn(usize) -> &'static str) -> f64 {
        let config = testing::config();
        let stage = testing::planned(StageKind::Kbet, None);
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        let mut ds = testing::blobs(2, 20);
        let batch = (0..40).map(|i| batch_of(i).to_string()).collect();
        ds.obs_mut().insert("batch", Column::Str(batch)).unwrap();
        let params = KbetParams {
            batch: "batch".into(),
            alpha: 0.05,
            k: 10,
        };
        run(&ctx, &mut ds, &params).unwrap();
        match ds.uns().get("kBET_accept_rate") {
            Some(UnsValue::Float(rate)) => *rate,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_segregated_batches_are_rejected() {
        let segregated = accept_rate(|i| if i < 20 { "a" } else { "b" });
        let mixed = accept_rate(|i| if i % 2 == 0 { "a" } else { "b" });
        assert_eq!(segregated, 0.0);
        assert!(mixed > segregated);
    }

    #[test]
    fn test_single_batch_and_missing_attribute() {
        let config = testing::config();
        let stage = testing::planned(StageKind::Kbet, None);
        let ctx = StageContext {
            config: &config,
            stage: &stage,
        };
        let mut ds = testing::blobs(2, 5);
        let params = KbetParams {
            batch: "batch".into(),
            alpha: 0.05,
            k: 3,
        };
        assert!(run(&ctx, &mut ds, &params).unwrap_err().is::<DataError>());
        ds.obs_mut()
            .insert("batch", Column::Str(vec!["a".into(); 10]))
            .unwrap();
        assert!(run(&ctx, &mut ds, &params).unwrap_err().is::<DataError>());
    }
}
