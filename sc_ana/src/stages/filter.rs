//! Quality-control filtering of cells and genes

use super::ROBUST;
use crate::config::FilterParams;
use crate::errors::DataError;
use anyhow::Result;
use log::info;
use sc_types::{Column, Dataset, MatrixState};

/// Cell attribute holding the sample channel.
pub const CHANNEL: &str = "Channel";

/// Per-cell QC metrics: (genes detected, total counts, percent mitochondrial).
pub fn qc_metrics(ds: &Dataset, mito_prefixes: &[String]) -> (Vec<i64>, Vec<f64>, Vec<f64>) {
    let mito: Vec<bool> = ds
        .feature_names()
        .iter()
        .map(|name| mito_prefixes.iter().any(|p| name.starts_with(p.as_str())))
        .collect();
    let mut n_genes = Vec::with_capacity(ds.n_cells());
    let mut n_counts = Vec::with_capacity(ds.n_cells());
    let mut percent_mito = Vec::with_capacity(ds.n_cells());
    for row in ds.matrix().outer_iterator() {
        let (mut genes, mut total, mut mt) = (0, 0.0, 0.0);
        for (j, &v) in row.iter() {
            if v > 0.0 {
                genes += 1;
            }
            total += v;
            if mito[j] {
                mt += v;
            }
        }
        n_genes.push(genes);
        n_counts.push(total);
        percent_mito.push(if total > 0.0 { 100.0 * mt / total } else { 0.0 });
    }
    (n_genes, n_counts, percent_mito)
}

/// Channel of a 10x-style barcode: the suffix after the last `-`, or `1`.
fn barcode_channel(barcode: &str) -> String {
    match barcode.rsplit_once('-') {
        Some((_, suffix)) if !suffix.is_empty() => suffix.to_string(),
        _ => "1".to_string(),
    }
}

pub fn run(ds: &mut Dataset, params: &FilterParams) -> Result<()> {
    let (n_cells, n_features) = (ds.n_cells(), ds.n_features());
    let (n_genes, n_counts, percent_mito) = qc_metrics(ds, &params.mito_prefixes);

    let singlet: Option<Vec<bool>> = if params.select_singlets {
        let demux = ds.obs().get("demux_type").ok_or_else(|| {
            DataError::new("select_singlets needs the cell attribute 'demux_type'")
        })?;
        Some((0..n_cells).map(|i| demux.value_str(i) == "singlet").collect())
    } else {
        None
    };

    let keep: Vec<usize> = (0..n_cells)
        .filter(|&i| {
            let genes = n_genes[i] as u64;
            let counts = n_counts[i];
            (params.min_genes..params.max_genes).contains(&genes)
                && counts >= params.min_umis as f64
                && counts < params.max_umis as f64
                && percent_mito[i] < params.percent_mito
                && singlet.as_ref().map_or(true, |s| s[i])
        })
        .collect();
    if keep.is_empty() {
        return Err(DataError::new(format!("no cell of {n_cells} passes the QC thresholds")).into());
    }

    // read before black-listed attributes are dropped, the channel may be one of them
    let channel: Option<Vec<String>> = if let Some(attr) = &params.channel_attr {
        let column = ds
            .obs()
            .get(attr)
            .ok_or_else(|| DataError::new(format!("channel attribute '{attr}' does not exist")))?;
        Some((0..n_cells).map(|i| column.value_str(i).into_owned()).collect())
    } else if !ds.obs().contains(CHANNEL) {
        Some(ds.barcodes().iter().map(|b| barcode_channel(b)).collect())
    } else {
        None
    };

    let obs = ds.obs_mut();
    obs.insert("n_genes", Column::Int(n_genes))?;
    obs.insert("n_counts", Column::Float(n_counts))?;
    obs.insert("percent_mito", Column::Float(percent_mito))?;
    for attr in &params.black_list {
        obs.remove(attr);
    }
    if let Some(channel) = channel {
        obs.insert(CHANNEL, Column::Str(channel))?;
    }

    ds.subset_cells(&keep)?;
    let nnz = ds.column_nnz();
    let expressed: Vec<usize> = (0..n_features).filter(|&j| nnz[j] > 0).collect();
    ds.subset_features(&expressed)?;

    let n_kept = ds.n_cells() as f64;
    let n_cells_col: Vec<i64> = expressed.iter().map(|&j| nnz[j] as i64).collect();
    let percent_cells: Vec<f64> = n_cells_col.iter().map(|&c| 100.0 * c as f64 / n_kept).collect();
    let robust: Vec<bool> = percent_cells
        .iter()
        .map(|&p| p >= params.gene_percent_cells)
        .collect();
    let n_robust = robust.iter().filter(|&&r| r).count();
    let var = ds.var_mut();
    var.insert("n_cells", Column::Int(n_cells_col))?;
    var.insert("percent_cells", Column::Float(percent_cells))?;
    var.insert(ROBUST, Column::Bool(robust))?;
    ds.set_state(MatrixState::Filtered)?;

    info!(
        "filtering kept {} of {n_cells} cells and {} of {n_features} genes ({n_robust} robust)",
        ds.n_cells(),
        ds.n_features()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn params() -> FilterParams {
        FilterParams {
            min_genes: 2,
            max_genes: 4,
            min_umis: 3,
            max_umis: 100,
            mito_prefixes: vec!["MT-".into()],
            percent_mito: 50.0,
            gene_percent_cells: 60.0,
            select_singlets: false,
            black_list: vec!["junk".into()],
            channel_attr: None,
        }
    }

    fn dataset() -> Dataset {
        // genes: A, B, MT-1, C
        let counts = array![
            [1.0, 1.0, 0.0, 1.0], // kept
            [5.0, 0.0, 0.0, 0.0], // one gene
            [1.0, 0.0, 4.0, 0.0], // 80% mito
            [2.0, 2.0, 1.0, 0.0], // kept
            [1.0, 1.0, 0.0, 0.0], // 2 counts, below min_umis
        ];
        let barcodes = ["AAA-1", "CCC-1", "GGG-2", "TTT-2", "ACG-2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let features = ["A", "B", "MT-1", "C"].iter().map(|s| s.to_string()).collect();
        let mut ds = Dataset::from_dense(barcodes, features, counts.view()).unwrap();
        ds.obs_mut()
            .insert("junk", Column::Int(vec![0; 5]))
            .unwrap();
        ds
    }

    #[test]
    fn test_qc_metrics() {
        let ds = dataset();
        let (genes, counts, mito) = qc_metrics(&ds, &["MT-".to_string()]);
        assert_eq!(genes, vec![3, 1, 2, 3, 2]);
        assert_eq!(counts, vec![3.0, 5.0, 5.0, 5.0, 2.0]);
        assert!((mito[2] - 80.0).abs() < 1e-12);
    }

    #[test]
    fn test_filter_cells_and_genes() {
        let mut ds = dataset();
        run(&mut ds, &params()).unwrap();
        assert_eq!(ds.barcodes(), ["AAA-1", "TTT-2"]);
        assert_eq!(ds.feature_names(), ["A", "B", "MT-1", "C"]);
        assert_eq!(ds.state(), MatrixState::Filtered);
        assert!(!ds.obs().contains("junk"));
        assert_eq!(
            ds.obs().get(CHANNEL),
            Some(&Column::Str(vec!["1".into(), "2".into()]))
        );
        assert_eq!(
            ds.var().get(ROBUST),
            Some(&Column::Bool(vec![true, true, false, false]))
        );
        assert_eq!(ds.obs().get("n_genes"), Some(&Column::Int(vec![3, 3])));
    }

    #[test]
    fn test_black_listed_channel_attribute_is_still_read() {
        let mut ds = dataset();
        let lanes = ["L1", "L1", "L2", "L2", "L3"].iter().map(|s| s.to_string()).collect();
        ds.obs_mut().insert("lane", Column::Str(lanes)).unwrap();
        let p = FilterParams {
            black_list: vec!["junk".into(), "lane".into()],
            channel_attr: Some("lane".into()),
            ..params()
        };
        run(&mut ds, &p).unwrap();
        assert!(!ds.obs().contains("lane"));
        assert_eq!(
            ds.obs().get(CHANNEL),
            Some(&Column::Str(vec!["L1".into(), "L2".into()]))
        );
    }

    #[test]
    fn test_unexpressed_genes_are_dropped() {
        let mut ds = dataset();
        let p = FilterParams {
            min_genes: 1,
            max_genes: 2,
            min_umis: 1,
            ..params()
        };
        // only the single-gene cell passes
        run(&mut ds, &p).unwrap();
        assert_eq!(ds.barcodes(), ["CCC-1"]);
        assert_eq!(ds.feature_names(), ["A"]);
    }

    #[test]
    fn test_singlets_and_empty_result() {
        let mut ds = dataset();
        let p = FilterParams {
            select_singlets: true,
            ..params()
        };
        let err = run(&mut ds, &p).unwrap_err();
        assert!(err.is::<DataError>());

        let mut ds = dataset();
        ds.obs_mut()
            .insert(
                "demux_type",
                Column::Str(
                    ["singlet", "singlet", "singlet", "doublet", "singlet"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
            )
            .unwrap();
        run(&mut ds, &p).unwrap();
        assert_eq!(ds.barcodes(), ["AAA-1"]);

        let mut ds = dataset();
        let p = FilterParams {
            min_genes: 10,
            max_genes: 20,
            ..params()
        };
        assert!(run(&mut ds, &p).is_err());
    }
}
