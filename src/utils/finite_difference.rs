//! Finite difference Jacobians of vector functions.

use ndarray::{Array1, Array2, ArrayView1};

use crate::error::{FitError, Result};

/// Relative step size for forward differences.
pub const DEFAULT_RELATIVE_STEP: f64 = 1e-7;

/// Smallest absolute step.
pub const MIN_STEP: f64 = 1e-12;

/// Jacobian of `f` at `x` by forward differences.
///
/// The step for `x[j]` is `relative_step · |x[j]|`, but never less than
/// [`MIN_STEP`]. `fx` must be `f(x)`, so that it is not evaluated again.
pub fn forward_jacobian<F>(
    mut f: F,
    x: ArrayView1<'_, f64>,
    fx: ArrayView1<'_, f64>,
    relative_step: f64,
) -> Result<Array2<f64>>
where
    F: FnMut(ArrayView1<'_, f64>) -> Result<Array1<f64>>,
{
    let n = x.len();
    let m = fx.len();
    let mut jac = Array2::zeros((m, n));
    let mut shifted = x.to_owned();
    for j in 0..n {
        let step = (relative_step * x[j].abs()).max(MIN_STEP);
        shifted[j] = x[j] + step;
        let fs = f(shifted.view())?;
        shifted[j] = x[j];
        if fs.len() != m {
            return Err(FitError::DimensionMismatch(format!(
                "function returned {} values, expected {}",
                fs.len(),
                m
            )));
        }
        let mut col = jac.column_mut(j);
        col.assign(&((&fs - &fx) / step));
    }
    Ok(jac)
}
