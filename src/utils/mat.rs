//! Small helpers over channel-major `ndarray` matrices.
//!
//! Every activation in the crate is an `Array2<f64>` shaped
//! `(channels, height * width)`, spatial positions flattened row-major.

use crate::utils::error::{NetError, Result};
use ndarray::{Array, Array2, ArrayView2, Axis, Dimension, ShapeBuilder};
use rand::Rng;
use rand_distr::{Distribution, Normal};

pub type Size = (usize, usize);

pub fn spatial_len(size: Size) -> usize {
    size.0 * size.1
}

pub fn check_shape(context: &str, got: &[usize], expected: &[usize]) -> Result<()> {
    if got != expected {
        return Err(NetError::shape(context, expected, got));
    }
    Ok(())
}

/// Draws every entry from `N(0, sigma)`.
pub fn normal_init<Sh, D, R>(shape: Sh, sigma: f64, rng: &mut R) -> Result<Array<f64, D>>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(NetError::InvalidConfiguration(format!(
            "normal init: standard deviation must be positive, got {}",
            sigma
        )));
    }
    let normal = Normal::new(0.0, sigma)
        .map_err(|err| NetError::InvalidConfiguration(format!("normal init: {}", err)))?;
    Ok(Array::from_shape_fn(shape, |_| normal.sample(rng)))
}

/// Scales each column of `matrix` to unit Euclidean norm.
///
/// A column whose norm is zero or not finite is restored from `fallback`
/// instead. Returns the indices of the restored columns.
pub fn normalize_columns(matrix: &mut Array2<f64>, fallback: ArrayView2<f64>) -> Vec<usize> {
    let mut degenerate = Vec::new();
    for (idx, (mut col, prev)) in matrix
        .axis_iter_mut(Axis(1))
        .zip(fallback.axis_iter(Axis(1)))
        .enumerate()
    {
        let norm = col.dot(&col).sqrt();
        if norm > 0.0 && norm.is_finite() {
            col.mapv_inplace(|v| v / norm);
        } else {
            col.assign(&prev);
            degenerate.push(idx);
        }
    }
    degenerate
}

pub fn column_norms(matrix: ArrayView2<f64>) -> Vec<f64> {
    matrix
        .axis_iter(Axis(1))
        .map(|col| col.dot(&col).sqrt())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn normalize_scales_columns() {
        let mut m = array![[3.0, 0.0], [4.0, 2.0]];
        let prev = m.clone();
        let degenerate = normalize_columns(&mut m, prev.view());
        assert!(degenerate.is_empty());
        assert_abs_diff_eq!(m[[0, 0]], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(m[[1, 0]], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(m[[1, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_column_falls_back() {
        let prev = array![[1.0, 0.0], [0.0, 1.0]];
        let mut m = array![[0.0, 2.0], [0.0, 0.0]];
        let degenerate = normalize_columns(&mut m, prev.view());
        assert_eq!(degenerate, vec![0]);
        assert_eq!(m.column(0), prev.column(0));
        assert!(m.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn normal_init_rejects_bad_sigma() {
        let mut rng = StdRng::seed_from_u64(7);
        for sigma in [-1.0, 0.0, f64::NAN, f64::INFINITY] {
            let res: Result<Array2<f64>> = normal_init((2, 2), sigma, &mut rng);
            assert!(matches!(res, Err(NetError::InvalidConfiguration(_))));
        }
        let ok: Array2<f64> = normal_init((2, 2), 0.5, &mut rng).unwrap();
        assert!(ok.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn check_shape_reports_both_sides() {
        let err = check_shape("head", &[2, 3], &[2, 4]).unwrap_err();
        match err {
            NetError::ShapeMismatch {
                expected, got, ..
            } => {
                assert_eq!(expected, vec![2, 4]);
                assert_eq!(got, vec![2, 3]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
