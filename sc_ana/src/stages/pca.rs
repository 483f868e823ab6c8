use super::{flagged_features, StageContext, HIGHLY_VARIABLE};
use crate::config::PcaParams;
use crate::linalg;
use anyhow::{Context, Result};
use log::info;
use ndarray::{Array2, Axis};
use sc_types::{basis, Dataset, UnsValue};

const MAX_ABS_Z: f64 = 10.0;

/// Scale every column to zero mean and unit variance, clipping at
/// `MAX_ABS_Z`. Constant columns become zero.
pub fn standardize(values: &mut Array2<f64>) {
    for mut col in values.axis_iter_mut(Axis(1)) {
        let (mean, var) = stats::mean_var(col.iter().copied());
        let std = var.sqrt();
        col.mapv_inplace(|v| {
            if std > 0.0 {
                ((v - mean) / std).clamp(-MAX_ABS_Z, MAX_ABS_Z)
            } else {
                0.0
            }
        });
    }
}

/// Principal components of the batch-corrected layer, or of the selected
/// features of the normalized matrix.
pub fn run(ctx: &StageContext<'_>, ds: &mut Dataset, params: &PcaParams) -> Result<()> {
    let (source, mut values) = match ds.corrected() {
        Some(layer) => ("batch-corrected", layer.values.clone()),
        None => {
            let features = flagged_features(ds, HIGHLY_VARIABLE);
            ("selected", ds.dense_columns(&features))
        }
    };
    standardize(&mut values);
    let fit = linalg::pca(values.view(), params.n_pc, ctx.seed()).context("principal components")?;
    info!(
        "computed {} principal components of {} {source} features; first explains {:.1}% of variance",
        fit.scores.ncols(),
        values.ncols(),
        100.0 * fit.variance_ratio.first().copied().unwrap_or(0.0)
    );
    ds.set_uns("pca_variance", UnsValue::Floats(fit.variance.to_vec()));
    ds.set_uns("pca_variance_ratio", UnsValue::Floats(fit.variance_ratio.to_vec()));
    ds.insert_embedding(basis::PCA, fit.scores)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_standardize() {
        let mut x = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]];
        standardize(&mut x);
        assert_eq!(x.column(1).to_vec(), vec![0.0, 0.0, 0.0]);
        assert!((x[[0, 0]] + 1.0).abs() < 1e-12);
        assert!((x[[2, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_standardize_clips() {
        let mut x = Array2::zeros((401, 1));
        x[[0, 0]] = 1000.0;
        standardize(&mut x);
        assert_eq!(x[[0, 0]], MAX_ABS_Z);
    }
}
