//! Location/scale batch correction within groups of comparable cells

use super::filter::CHANNEL;
use super::{flagged_features, HIGHLY_VARIABLE};
use crate::config::BatchParams;
use crate::errors::DataError;
use anyhow::Result;
use log::{debug, info};
use ndarray::{Array2, Axis};
use sc_types::{CorrectedLayer, Dataset};
use std::collections::BTreeMap;

// channels whose standard deviation falls below this are only shifted
const MIN_STD: f64 = 1e-8;

/// Per-column mean and standard deviation (ddof 0) over `rows`.
fn moments(values: &Array2<f64>, rows: &[usize]) -> (Vec<f64>, Vec<f64>) {
    let sub = values.select(Axis(0), rows);
    let mean = sub.mean_axis(Axis(0)).map(|m| m.to_vec()).unwrap_or_default();
    let std = sub.std_axis(Axis(0), 0.0).to_vec();
    (mean, std)
}

/// Map the per-channel moments of every column onto the pooled moments of
/// the group, in place.
fn adjust_group(values: &mut Array2<f64>, channels: &BTreeMap<&str, Vec<usize>>, group: &[usize]) {
    if channels.len() < 2 {
        return;
    }
    let (pooled_mean, pooled_std) = moments(values, group);
    for rows in channels.values() {
        let (mean, std) = moments(values, rows);
        for j in 0..values.ncols() {
            let scale = if std[j] > MIN_STD { pooled_std[j] / std[j] } else { 1.0 };
            for &i in rows {
                let v = &mut values[[i, j]];
                *v = (*v - mean[j]) * scale + pooled_mean[j];
            }
        }
    }
}

pub fn run(ds: &mut Dataset, params: &BatchParams) -> Result<()> {
    let groups = params.group_by.resolve(ds.obs())?;
    let channel = ds
        .obs()
        .get(CHANNEL)
        .ok_or_else(|| DataError::new(format!("batch correction needs the cell attribute '{CHANNEL}'")))?;
    let channel: Vec<String> = (0..ds.n_cells())
        .map(|i| channel.value_str(i).into_owned())
        .collect();

    let features = flagged_features(ds, HIGHLY_VARIABLE);
    let mut values = ds.dense_columns(&features);
    for (g, members) in groups.members().iter().enumerate() {
        if members.is_empty() {
            continue;
        }
        let mut channels: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for &i in members {
            channels.entry(channel[i].as_str()).or_default().push(i);
        }
        debug!(
            "group '{}': {} cells in {} channels",
            groups.label(g),
            members.len(),
            channels.len()
        );
        adjust_group(&mut values, &channels, members);
    }
    info!(
        "corrected {} features of {} cells within {} groups",
        features.len(),
        ds.n_cells(),
        groups.n_groups()
    );
    ds.set_corrected(CorrectedLayer { features, values })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::GroupingExpr;
    use ndarray::array;
    use sc_types::Column;

    fn dataset() -> Dataset {
        // channel 2 carries a constant offset of 10 on both genes
        let dense = array![[1.0, 2.0], [3.0, 4.0], [11.0, 12.0], [13.0, 14.0]];
        let mut ds = Dataset::from_dense(
            (0..4).map(|i| format!("c{i}")).collect(),
            vec!["g1".into(), "g2".into()],
            dense.view(),
        )
        .unwrap();
        let obs = ds.obs_mut();
        obs.insert(CHANNEL, Column::Str(vec!["1".into(), "1".into(), "2".into(), "2".into()]))
            .unwrap();
        obs.insert("tissue", Column::Str(vec!["a".into(); 4])).unwrap();
        ds
    }

    #[test]
    fn test_channels_are_aligned() {
        let mut ds = dataset();
        let params = BatchParams {
            group_by: GroupingExpr::parse(Some("tissue")).unwrap(),
        };
        run(&mut ds, &params).unwrap();
        let layer = ds.corrected().unwrap();
        assert_eq!(layer.features, vec![0, 1]);
        let v = &layer.values;
        // both channels now share the pooled mean of 7 for gene 1
        assert!(((v[[0, 0]] + v[[1, 0]]) / 2.0 - 7.0).abs() < 1e-9);
        assert!(((v[[2, 0]] + v[[3, 0]]) / 2.0 - 7.0).abs() < 1e-9);
        assert!((v[[0, 0]] - v[[2, 0]]).abs() < 1e-9);
    }

    #[test]
    fn test_separate_groups_are_untouched() {
        let mut ds = dataset();
        let params = BatchParams {
            group_by: GroupingExpr::parse(Some(CHANNEL)).unwrap(),
        };
        run(&mut ds, &params).unwrap();
        assert_eq!(ds.corrected().unwrap().values, ds.dense_columns(&[0, 1]));
    }

    #[test]
    fn test_unknown_attribute_fails() {
        let mut ds = dataset();
        let params = BatchParams {
            group_by: GroupingExpr::parse(Some("donor")).unwrap(),
        };
        assert!(run(&mut ds, &params).is_err());
    }
}
