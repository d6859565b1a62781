//! Block solves and inverses of random normal equations compared with
//! their dense counterparts.

use approx::assert_relative_eq;
use multifit_rs::{ABDMatrix, FitError};
use ndarray::{Array1, Array2};

use crate::test_helpers::{block_sizes, random_block_jacobian};

fn normal_equations(globals: usize, locals: &[usize], seed: u64) -> (ABDMatrix, Array2<f64>) {
    let jacobian = random_block_jacobian(globals, locals, 12, seed);
    let mut abd = ABDMatrix::new(&block_sizes(globals, locals)).unwrap();
    abd.set_from_product(jacobian.view()).unwrap();
    abd.add_to_diagonal(0.5);
    let mut dense = jacobian.t().dot(&jacobian);
    dense.diag_mut().mapv_inplace(|v| v + 0.5);
    (abd, dense)
}

#[test]
fn test_product_pattern_matches_dense_product() {
    let (abd, dense) = normal_equations(2, &[3, 1, 2], 1);
    assert_eq!(abd.total_size(), 8);
    for i in 0..8 {
        for j in 0..8 {
            assert_relative_eq!(abd.get(i, j).unwrap(), dense[[i, j]], epsilon = 1e-12);
        }
    }
    assert_eq!(abd.expand_to_full_matrix().dim(), (8, 8));
}

#[test]
fn test_random_solves_match_dense() {
    for (seed, locals) in [(2, vec![3, 3, 3]), (3, vec![1, 0, 4, 2]), (4, vec![2; 12])] {
        let (abd, dense) = normal_equations(3, &locals, seed);
        let rhs = Array1::from_shape_fn(dense.nrows(), |i| 1.0 + (i as f64).cos());
        let x = abd.solve(rhs.view()).unwrap();
        let back = dense.dot(&x);
        for (b, r) in back.iter().zip(rhs.iter()) {
            assert_relative_eq!(*b, *r, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_single_dataset_without_locals() {
    let (abd, dense) = normal_equations(4, &[0], 5);
    assert_eq!(abd.block_sizes(), &[4, 0]);
    let rhs = Array1::from_elem(4, 1.0);
    let x = abd.solve(rhs.view()).unwrap();
    let back = dense.dot(&x);
    for v in back.iter() {
        assert_relative_eq!(*v, 1.0, epsilon = 1e-10);
    }
}

#[test]
fn test_without_globals_blocks_are_independent() {
    let (abd, dense) = normal_equations(0, &[2, 3], 6);
    let inverse = abd.invert().unwrap();
    assert_relative_eq!(inverse[[0, 3]], 0.0);
    let identity = dense.dot(&inverse);
    for i in 0..5 {
        for j in 0..5 {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_relative_eq!(identity[[i, j]], expected, epsilon = 1e-10);
        }
    }
}

#[test]
fn test_almost_inverse_holds_the_in_pattern_entries() {
    let (abd, _) = normal_equations(2, &[2, 2, 2], 7);
    let full = abd.invert().unwrap();
    let partial = abd.almost_invert().unwrap();
    for i in 0..8 {
        for j in 0..8 {
            let crosses_locals = i >= 2 && j >= 2 && (i - 2) / 2 != (j - 2) / 2;
            let expected = if crosses_locals { 0.0 } else { full[[i, j]] };
            assert_relative_eq!(partial.get(i, j).unwrap(), expected, epsilon = 1e-10);
        }
    }
    // The full inverse does couple distinct datasets through the globals
    assert!(full[[2, 4]].abs() > 0.0);
}

#[test]
fn test_gram_with_cross_terms_is_reported() {
    let (abd, mut dense) = normal_equations(1, &[1, 1], 8);
    let mut target = ABDMatrix::new(abd.block_sizes()).unwrap();
    assert_eq!(target.set_from_gram(dense.view()).unwrap(), 0);

    dense[[1, 2]] = 0.3;
    dense[[2, 1]] = 0.3;
    assert_eq!(target.set_from_gram(dense.view()).unwrap(), 2);
    assert_eq!(target.get(1, 2).unwrap(), 0.0);
}

#[test]
fn test_singular_block_is_named() {
    let mut abd = ABDMatrix::new(&[1, 2, 2]).unwrap();
    abd.add_to_diagonal(1.0);
    abd.set(3, 3, 0.0).unwrap();
    abd.set(4, 4, 0.0).unwrap();
    match abd.solve(Array1::ones(5).view()) {
        Err(FitError::SingularMatrix { block, .. }) => assert_eq!(block, 2),
        other => panic!("expected a singular block, got {:?}", other),
    }
}

#[test]
fn test_invalid_constructions() {
    assert!(ABDMatrix::new(&[]).is_err());
    let mut abd = ABDMatrix::new(&[1, 1, 1]).unwrap();
    assert!(abd.set(1, 2, 1.0).unwrap_err().is_logic());
    assert!(abd.get(3, 0).is_err());
    assert!(abd.solve(Array1::ones(2).view()).is_err());
}
