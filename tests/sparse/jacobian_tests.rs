//! Sparse and dense jacobians filled through the same per-definition
//! addressing must describe the same derivatives.

use approx::assert_relative_eq;
use multifit_rs::parameters::FitLayout;
use multifit_rs::sparse::correlation_matrix;
use multifit_rs::{ABDMatrix, SparseCovariance, SparseJacobian};
use ndarray::{arr1, Array2};

/// Potential `E0` shared by two datasets, rate `k` fitted in each.
fn e0_k_layout() -> FitLayout {
    FitLayout::builder(2).global("E0").local("k").build().unwrap()
}

const ROWS: [usize; 2] = [3, 4];

fn filled(layout: &FitLayout, sparse: bool) -> SparseJacobian {
    let mut jac = SparseJacobian::new(layout, &ROWS, sparse).unwrap();
    for ds in 0..2 {
        for def in 0..layout.definition_count() {
            if let Some(mut col) = jac.parameter_vector_for(def, Some(ds)) {
                for (i, v) in col.iter_mut().enumerate() {
                    *v = (1 + def) as f64 * (i as f64 + 1.0) + 10.0 * ds as f64;
                }
            }
        }
    }
    jac.splice_all().unwrap();
    jac
}

#[test]
fn test_three_free_parameters_two_sparse_columns() {
    let layout = e0_k_layout();
    assert_eq!(layout.free_count(), 3);
    assert_eq!(layout.block_sizes(), vec![1, 1, 1]);

    let sparse = filled(&layout, true);
    let dense = filled(&layout, false);
    assert_eq!(sparse.matrix().ncols(), 2);
    assert_eq!(dense.matrix().ncols(), 3);
    assert_eq!(sparse.to_dense().unwrap(), dense.to_dense().unwrap());

    // k of dataset 0 has no derivative in the rows of dataset 1
    let d = dense.to_dense().unwrap();
    for row in 3..7 {
        assert_eq!(d[[row, 1]], 0.0);
    }
}

#[test]
fn test_normal_equations_agree() {
    let layout = e0_k_layout();
    let sparse = filled(&layout, true);
    let dense = filled(&layout, false);

    let mut full = Array2::zeros((3, 3));
    dense.compute_jtj(&mut full).unwrap();
    let mut blocks = ABDMatrix::new(&layout.block_sizes()).unwrap();
    sparse.compute_jtj_abd(&mut blocks).unwrap();
    assert_eq!(blocks.expand_to_full_matrix(), full);
    assert_eq!(full[[1, 2]], 0.0);

    let func = arr1(&[1.0, -1.0, 0.5, 2.0, 0.0, -0.5, 1.0]);
    let g1 = sparse.compute_gradient(func.view(), -1.0).unwrap();
    let g2 = dense.compute_gradient(func.view(), -1.0).unwrap();
    for (a, b) in g1.iter().zip(g2.iter()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_splicing_twice_is_a_logic_error() {
    let layout = e0_k_layout();
    let mut dense = filled(&layout, false);
    assert!(dense.splice_parameter(1).unwrap_err().is_logic());

    let mut sparse = filled(&layout, true);
    assert!(sparse.splice_parameter(1).is_ok());
    assert!(sparse.splice_parameter(5).unwrap_err().is_logic());
}

#[test]
fn test_fixed_local_instance() {
    let layout = FitLayout::builder(2)
        .global("E0")
        .local("k")
        .fix("k", Some(1))
        .build()
        .unwrap();
    assert_eq!(layout.block_sizes(), vec![1, 1, 0]);
    let mut jac = SparseJacobian::new(&layout, &ROWS, true).unwrap();
    assert!(jac.parameter_vector_for(1, Some(1)).is_none());
    assert!(jac.parameter_vector_for(1, Some(0)).is_some());
    assert_eq!(jac.index_map().fit_index(1, 1), None);
}

#[test]
fn test_block_covariance_keeps_rates_independent() {
    let layout = e0_k_layout();
    let jac = filled(&layout, true);
    let mut blocks = ABDMatrix::new(&layout.block_sizes()).unwrap();
    jac.compute_jtj_abd(&mut blocks).unwrap();
    let inverse = blocks.almost_invert().unwrap();
    let covar = SparseCovariance::from_blocks(&layout, inverse).unwrap();

    let map = covar.index_map();
    let k0 = map.logical_index(1, 0);
    let k1 = map.logical_index(1, 1);
    assert_eq!(covar.get(k0, k1).unwrap(), 0.0);
    assert!(covar.get(k0, k0).unwrap() > 0.0);

    // The global potential reads the same in both datasets
    let e_0 = map.logical_index(0, 0);
    let e_1 = map.logical_index(0, 1);
    assert_eq!(covar.get(e_0, k1).unwrap(), covar.get(e_1, k1).unwrap());

    let correl = correlation_matrix(&covar.to_dense());
    assert_relative_eq!(correl[[0, 0]], 1.0);
    assert_eq!(covar.standard_errors().len(), 3);
}
