//! Eigen-solvers used by PCA and the diffusion map: a randomized range
//! finder around nalgebra's dense QR and symmetric eigen-decomposition

use crate::errors::DataError;
use anyhow::Result;
use log::warn;
use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand::SeedableRng;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;

fn to_nalgebra(a: ArrayView2<'_, f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn to_ndarray(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Orthonormal basis of the column space of `m`, `m.nrows() >= m.ncols()`.
pub fn orthonormalize_columns(m: ArrayView2<'_, f64>) -> Array2<f64> {
    to_ndarray(&to_nalgebra(m).qr().q())
}

/// Eigen-decomposition of a symmetric matrix. Eigenvalues are returned in
/// descending order with the eigenvectors as the matching columns.
pub fn symmetric_eigen(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(DataError::new(format!("matrix of shape {:?} is not square", a.dim())).into());
    }
    if a.iter().any(|x| !x.is_finite()) {
        return Err(DataError::new("matrix contains non-finite values").into());
    }
    let eigen = to_nalgebra(a.view())
        .try_symmetric_eigen(f64::EPSILON, 0)
        .ok_or_else(|| DataError::new("symmetric eigen-decomposition did not converge"))?;
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| eigen.eigenvalues[j].total_cmp(&eigen.eigenvalues[i]));
    let values = order.iter().map(|&i| eigen.eigenvalues[i]).collect();
    let vectors = to_ndarray(&eigen.eigenvectors).select(Axis(1), &order);
    Ok((values, vectors))
}

/// Leading `k` eigenpairs of a symmetric positive semi-definite operator of
/// size `n`, by randomized subspace iteration followed by a Rayleigh-Ritz
/// projection. `apply` maps an `n x l` block to `A` times that block.
pub fn top_eigenpairs<F, R>(
    n: usize,
    k: usize,
    apply: F,
    n_iter: usize,
    oversample: usize,
    rng: &mut R,
) -> Result<(Array1<f64>, Array2<f64>)>
where
    F: Fn(ArrayView2<'_, f64>) -> Array2<f64>,
    R: Rng,
{
    let k = k.min(n);
    let l = (k + oversample).min(n);
    let start = Array2::from_shape_simple_fn((n, l), || rng.sample::<f64, _>(StandardNormal));
    let mut q = orthonormalize_columns(start.view());
    for _ in 0..n_iter {
        q = orthonormalize_columns(apply(q.view()).view());
    }
    let aq = apply(q.view());
    let b = q.t().dot(&aq);
    let b = (&b + &b.t()) / 2.0;
    let (values, w) = symmetric_eigen(&b)?;
    let vectors = q.dot(&w.slice(s![.., ..k]));
    Ok((values.slice(s![..k]).to_owned(), vectors))
}

#[derive(Debug, Clone)]
pub struct PcaFit {
    /// `cells x components` projections.
    pub scores: Array2<f64>,
    /// `features x components` loadings.
    pub loadings: Array2<f64>,
    /// Variance along each component.
    pub variance: Array1<f64>,
    pub variance_ratio: Array1<f64>,
}

/// Principal components of the rows of `x`. Components are oriented so the
/// largest-magnitude loading of each is positive.
pub fn pca(x: ArrayView2<'_, f64>, n_components: usize, seed: u64) -> Result<PcaFit> {
    let (n_cells, n_features) = x.dim();
    if n_cells < 2 || n_features == 0 {
        return Err(DataError::new(format!(
            "cannot compute principal components of a {n_cells} x {n_features} matrix"
        ))
        .into());
    }
    let max_components = n_cells.min(n_features);
    let n_components = if n_components > max_components {
        warn!(
            "matrix shape {:?} < requested PCs {n_components}, reducing to {max_components}",
            x.dim()
        );
        max_components
    } else {
        n_components
    };

    let Some(mean) = x.mean_axis(Axis(0)) else {
        return Err(DataError::new("empty matrix").into());
    };
    let centered = &x - &mean;
    let denom = (n_cells - 1) as f64;
    let total_variance: f64 = centered.iter().map(|v| v * v).sum::<f64>() / denom;

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let (variance, mut loadings) = top_eigenpairs(
        n_features,
        n_components,
        |q| centered.t().dot(&centered.dot(&q)) / denom,
        10,
        n_components,
        &mut rng,
    )?;

    for mut col in loadings.columns_mut() {
        let pivot = col
            .iter()
            .copied()
            .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            .unwrap_or(0.0);
        if pivot < 0.0 {
            col.mapv_inplace(|v| -v);
        }
    }
    let scores = centered.dot(&loadings);
    let variance = variance.mapv(|v| v.max(0.0));
    let variance_ratio = if total_variance > 0.0 {
        &variance / total_variance
    } else {
        Array1::zeros(variance.len())
    };
    Ok(PcaFit {
        scores,
        loadings,
        variance,
        variance_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_eigen_two_by_two() {
        let (values, vectors) = symmetric_eigen(&array![[2.0, 1.0], [1.0, 2.0]]).unwrap();
        assert!((values[0] - 3.0).abs() < 1e-10);
        assert!((values[1] - 1.0).abs() < 1e-10);
        let v = vectors.column(0);
        assert!((v[0].abs() - v[1].abs()).abs() < 1e-10);
        assert!(v[0] * v[1] > 0.0);
    }

    #[test]
    fn test_eigen_reconstructs() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 1.0]];
        let (values, vectors) = symmetric_eigen(&a).unwrap();
        let rebuilt = vectors.dot(&Array2::from_diag(&values)).dot(&vectors.t());
        for (x, y) in rebuilt.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-9);
        }
        assert!(values[0] >= values[1] && values[1] >= values[2]);
    }

    #[test]
    fn test_orthonormal_basis() {
        let m = array![[1.0, 1.0], [1.0, 0.0], [0.0, 1.0]];
        let q = orthonormalize_columns(m.view());
        assert_eq!(q.dim(), (3, 2));
        let gram = q.t().dot(&q);
        for ((i, j), v) in gram.indexed_iter() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert!((v - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_subspace_iteration_finds_top_of_diagonal() {
        let diag = array![1.0, 5.0, 0.5, 3.0, 0.1];
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let (values, vectors) = top_eigenpairs(
            5,
            2,
            |q| {
                let mut out = q.to_owned();
                for (mut row, d) in out.rows_mut().into_iter().zip(diag.iter()) {
                    row *= *d;
                }
                out
            },
            20,
            2,
            &mut rng,
        )
        .unwrap();
        assert!((values[0] - 5.0).abs() < 1e-8);
        assert!((values[1] - 3.0).abs() < 1e-8);
        assert!(vectors[[1, 0]].abs() > 0.999);
        assert!(vectors[[3, 1]].abs() > 0.999);
    }

    #[test]
    fn test_pca_on_a_line() {
        let x = Array2::from_shape_fn((20, 3), |(i, j)| (i as f64) * [1.0, 2.0, -1.0][j]);
        let fit = pca(x.view(), 2, 0).unwrap();
        assert_eq!(fit.scores.dim(), (20, 2));
        assert!(fit.variance_ratio[0] > 0.999);
        assert!(fit.variance[1].abs() < 1e-8);
        // Largest loading is positive.
        assert!(fit.loadings[[1, 0]] > 0.0);
        // Reduced to the feature count.
        assert_eq!(pca(x.view(), 10, 0).unwrap().scores.ncols(), 3);
    }
}
