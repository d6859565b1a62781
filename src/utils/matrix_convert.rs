//! Matrix conversion utilities.
//!
//! Storage across the crate is ndarray (`Array2`, `Array1`); the dense
//! factorizations come from nalgebra (`DMatrix`, `DVector`). These helpers
//! move data between the two without caring about memory order.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Convert an ndarray view to a nalgebra DMatrix.
///
/// # Arguments
///
/// * `arr` - The ndarray matrix (or view) to convert
///
/// # Returns
///
/// * A nalgebra DMatrix with the same data
pub fn ndarray_to_nalgebra(arr: ArrayView2<'_, f64>) -> DMatrix<f64> {
    // ndarray is row-major by default, nalgebra is column-major
    DMatrix::from_fn(arr.nrows(), arr.ncols(), |i, j| arr[[i, j]])
}

/// Convert a nalgebra DMatrix to an ndarray Array2.
pub fn nalgebra_to_ndarray(mat: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// Convert an ndarray vector view to a nalgebra DVector.
pub fn ndarray_vec_to_nalgebra(arr: ArrayView1<'_, f64>) -> DVector<f64> {
    DVector::from_iterator(arr.len(), arr.iter().copied())
}

/// Convert a nalgebra DVector to an ndarray Array1.
pub fn nalgebra_vec_to_ndarray(vec: &DVector<f64>) -> Array1<f64> {
    vec.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_matrix_conversion_keeps_layout() {
        let arr = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let mat = ndarray_to_nalgebra(arr.view());
        assert_eq!(mat.nrows(), 2);
        assert_eq!(mat.ncols(), 3);
        assert_eq!(mat[(1, 0)], 4.0);
        assert_eq!(mat[(0, 2)], 3.0);

        let back = nalgebra_to_ndarray(&mat);
        assert_eq!(back, arr);
    }

    #[test]
    fn test_transposed_view_conversion() {
        let arr = arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let mat = ndarray_to_nalgebra(arr.t());
        assert_eq!(mat.nrows(), 2);
        assert_eq!(mat[(1, 2)], 6.0);
    }

    #[test]
    fn test_vector_conversion() {
        let v = arr1(&[1.0, -2.0, 3.5]);
        let dv = ndarray_vec_to_nalgebra(v.view());
        assert_eq!(dv.len(), 3);
        assert_eq!(dv[1], -2.0);
        assert_eq!(nalgebra_vec_to_ndarray(&dv), v);
    }
}
