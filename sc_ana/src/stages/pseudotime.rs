use crate::config::PseudotimeParams;
use crate::errors::DataError;
use anyhow::Result;
use log::info;
use sc_types::{basis, Column, Dataset};
use std::collections::HashMap;

/// Euclidean distance in `diffmap` space to the nearest root cell, scaled to [0, 1].
pub fn run(ds: &mut Dataset, params: &PseudotimeParams) -> Result<()> {
    let index: HashMap<&str, usize> = ds
        .barcodes()
        .iter()
        .enumerate()
        .map(|(i, b)| (b.as_str(), i))
        .collect();
    let roots = params
        .roots
        .iter()
        .map(|r| {
            index
                .get(r.as_str())
                .copied()
                .ok_or_else(|| DataError::new(format!("root barcode '{r}' is not in the dataset")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if roots.is_empty() {
        return Err(DataError::new("pseudotime needs at least one root barcode").into());
    }

    let coords = ds.require_embedding(basis::DIFFMAP)?;
    let distance: Vec<f64> = coords
        .rows()
        .into_iter()
        .map(|cell| {
            roots
                .iter()
                .map(|&r| {
                    cell.iter()
                        .zip(coords.row(r))
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f64>()
                        .sqrt()
                })
                .fold(f64::INFINITY, f64::min)
        })
        .collect();
    let max = distance.iter().copied().fold(0.0, f64::max);
    let pseudotime = distance
        .iter()
        .map(|&d| if max > 0.0 { d / max } else { 0.0 })
        .collect();
    info!("pseudotime of {} cells from {} roots", distance.len(), roots.len());
    ds.obs_mut().insert("pseudotime", Column::Float(pseudotime))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn dataset() -> Dataset {
        let counts = array![[1.0], [1.0], [1.0]];
        let mut ds = Dataset::from_dense(
            vec!["a".into(), "b".into(), "c".into()],
            vec!["g".into()],
            counts.view(),
        )
        .unwrap();
        ds.insert_embedding(basis::DIFFMAP, array![[0.0, 0.0], [3.0, 4.0], [6.0, 8.0]])
            .unwrap();
        ds
    }

    #[test]
    fn test_scaled_distance_to_nearest_root() {
        let mut ds = dataset();
        run(&mut ds, &PseudotimeParams { roots: vec!["a".into()] }).unwrap();
        assert_eq!(
            ds.obs().get("pseudotime"),
            Some(&Column::Float(vec![0.0, 0.5, 1.0]))
        );

        let mut ds = dataset();
        run(
            &mut ds,
            &PseudotimeParams {
                roots: vec!["a".into(), "c".into()],
            },
        )
        .unwrap();
        assert_eq!(
            ds.obs().get("pseudotime"),
            Some(&Column::Float(vec![0.0, 1.0, 0.0]))
        );
    }

    #[test]
    fn test_unknown_root_is_a_data_error() {
        let mut ds = dataset();
        let err = run(&mut ds, &PseudotimeParams { roots: vec!["zzz".into()] }).unwrap_err();
        assert!(err.is::<DataError>());
    }
}
