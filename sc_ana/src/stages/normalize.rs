//! Size-factor normalization and log transform

use super::ROBUST;
use crate::config::NormalizeParams;
use anyhow::Result;
use log::info;
use sc_types::{Column, Dataset, MatrixState};

/// Scale every cell to `counts_per_cell_after` total counts, with the size
/// factor taken over the robust genes, then apply `log1p`.
pub fn run(ds: &mut Dataset, params: &NormalizeParams) -> Result<()> {
    let robust: Vec<bool> = match ds.var().get(ROBUST) {
        Some(Column::Bool(flags)) => flags.clone(),
        _ => vec![true; ds.n_features()],
    };
    let target = params.counts_per_cell_after;
    let mut empty = 0;
    ds.map_rows(|_, indices, values| {
        let size: f64 = indices
            .iter()
            .zip(values.iter())
            .filter(|(&j, _)| robust[j])
            .map(|(_, &v)| v)
            .sum();
        let scale = if size > 0.0 {
            target / size
        } else {
            empty += 1;
            0.0
        };
        for v in values.iter_mut() {
            *v = (*v * scale).ln_1p();
        }
    })?;
    ds.set_state(MatrixState::Normalized)?;
    info!(
        "normalized {} cells to {target} counts per cell ({empty} without robust counts)",
        ds.n_cells()
    );
    Ok(())
}
