//! Storage of the normal equations `JᵗJ δ = g`, dense or almost block diagonal.

use nalgebra::SVD;
use ndarray::{Array1, Array2, ArrayView1};

use crate::abd::ABDMatrix;
use crate::error::{FitError, Result};
use crate::parameters::FitLayout;
use crate::sparse::{SparseCovariance, SparseJacobian};
use crate::utils::matrix_convert::{
    nalgebra_to_ndarray, nalgebra_vec_to_ndarray, ndarray_to_nalgebra, ndarray_vec_to_nalgebra,
};

#[derive(Debug, Clone)]
pub(crate) enum NormalEquations {
    Dense(Array2<f64>),
    Blocks(ABDMatrix),
}

impl NormalEquations {
    pub(crate) fn new(layout: &FitLayout, sparse: bool) -> Result<Self> {
        if sparse {
            Ok(NormalEquations::Blocks(ABDMatrix::new(&layout.block_sizes())?))
        } else {
            let n = layout.free_count();
            Ok(NormalEquations::Dense(Array2::zeros((n, n))))
        }
    }

    /// Overwrites the matrix with `JᵗJ`.
    pub(crate) fn fill(&mut self, jacobian: &SparseJacobian) -> Result<()> {
        match self {
            NormalEquations::Dense(m) => jacobian.compute_jtj(m),
            NormalEquations::Blocks(m) => jacobian.compute_jtj_abd(m),
        }
    }

    pub(crate) fn copy_from(&mut self, other: &NormalEquations) -> Result<()> {
        match (self, other) {
            (NormalEquations::Dense(a), NormalEquations::Dense(b)) => {
                a.assign(b);
                Ok(())
            }
            (NormalEquations::Blocks(a), NormalEquations::Blocks(b)) => a.copy_from(b),
            _ => Err(FitError::Logic(
                "cannot copy between dense and block normal equations".to_string(),
            )),
        }
    }

    pub(crate) fn add_to_diagonal(&mut self, value: f64) {
        match self {
            NormalEquations::Dense(m) => m.diag_mut().mapv_inplace(|d| d + value),
            NormalEquations::Blocks(m) => m.add_to_diagonal(value),
        }
    }

    pub(crate) fn solve(&self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        match self {
            NormalEquations::Blocks(m) => m.solve(rhs),
            NormalEquations::Dense(m) => {
                let chol = ndarray_to_nalgebra(m.view())
                    .cholesky()
                    .ok_or_else(|| FitError::singular(0, "normal equations are not positive definite"))?;
                let x = chol.solve(&ndarray_vec_to_nalgebra(rhs));
                Ok(nalgebra_vec_to_ndarray(&x))
            }
        }
    }

    /// Covariance `factor · (JᵗJ)⁻¹`.
    ///
    /// The dense inverse is an SVD pseudo-inverse, so that parameters the
    /// data do not constrain get zero variance instead of failing the fit.
    pub(crate) fn covariance(
        &self,
        layout: &FitLayout,
        svd_tolerance: f64,
        factor: f64,
    ) -> Result<SparseCovariance> {
        match self {
            NormalEquations::Blocks(m) => {
                let mut inverse = m.almost_invert()?;
                inverse.scale(factor);
                SparseCovariance::from_blocks(layout, inverse)
            }
            NormalEquations::Dense(m) => {
                if m.is_empty() {
                    return SparseCovariance::from_dense(layout, m.clone());
                }
                let svd = SVD::new(ndarray_to_nalgebra(m.view()), true, true);
                let largest = svd.singular_values.iter().cloned().fold(0.0, f64::max);
                let pinv = svd
                    .pseudo_inverse(svd_tolerance * largest)
                    .map_err(|e| FitError::singular(0, e))?;
                SparseCovariance::from_dense(layout, nalgebra_to_ndarray(&pinv) * factor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr1;

    fn layout() -> FitLayout {
        FitLayout::builder(2).global("a").local("k").build().unwrap()
    }

    #[test]
    fn test_dense_and_blocks_agree() {
        let layout = layout();
        let rows = [3, 2];
        let a = [1.0, 2.0, 0.5, -1.0, 3.0];
        let k = [0.3, -0.2, 1.0, 2.0, 0.1];
        let fill = |sparse: bool| {
            let mut jac = SparseJacobian::new(&layout, &rows, sparse).unwrap();
            for (ds, range) in [(0usize, 0..3), (1, 3..5)] {
                jac.parameter_vector_for(0, Some(ds))
                    .unwrap()
                    .assign(&arr1(&a[range.clone()]));
                jac.parameter_vector_for(1, Some(ds))
                    .unwrap()
                    .assign(&arr1(&k[range]));
            }
            jac.splice_all().unwrap();
            jac
        };
        let jac = fill(true);
        let dense_jac = fill(false);

        let mut blocks = NormalEquations::new(&layout, true).unwrap();
        let mut dense = NormalEquations::new(&layout, false).unwrap();
        blocks.fill(&jac).unwrap();
        dense.fill(&dense_jac).unwrap();
        blocks.add_to_diagonal(0.1);
        dense.add_to_diagonal(0.1);

        let rhs = arr1(&[1.0, -2.0, 0.5]);
        let x1 = blocks.solve(rhs.view()).unwrap();
        let x2 = dense.solve(rhs.view()).unwrap();
        for i in 0..3 {
            assert_relative_eq!(x1[i], x2[i], epsilon = 1e-10);
        }

        let c1 = blocks.covariance(&layout, 1e-12, 2.0).unwrap().to_dense();
        let c2 = dense.covariance(&layout, 1e-12, 2.0).unwrap().to_dense();
        // The block inverse only keeps entries inside the sparsity pattern
        for (i, j) in [(0, 0), (0, 1), (0, 2), (1, 1), (2, 2), (1, 0)] {
            assert_relative_eq!(c1[[i, j]], c2[[i, j]], epsilon = 1e-9);
        }
        assert_eq!(c1[[1, 2]], 0.0);
    }

    #[test]
    fn test_mixed_copy_is_an_error() {
        let layout = layout();
        let mut blocks = NormalEquations::new(&layout, true).unwrap();
        let dense = NormalEquations::new(&layout, false).unwrap();
        assert!(blocks.copy_from(&dense).unwrap_err().is_logic());
    }
}
