//! Benchmarks of almost-block-diagonal solves against dense Cholesky.
//!
//! The normal equations of a fit over N datasets with a few global and a
//! few local parameters per dataset grow as N², while the block solve
//! stays linear in N.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use multifit_rs::ABDMatrix;
use nalgebra::{DMatrix, DVector};
use ndarray::{s, Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const GLOBALS: usize = 3;
const LOCALS: usize = 4;
const ROWS: usize = 20;

/// `JᵗJ + I` for a random jacobian with the multi-dataset sparsity pattern.
fn random_problem(datasets: usize) -> (ABDMatrix, Array1<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let n = GLOBALS + datasets * LOCALS;
    let mut jacobian = Array2::zeros((datasets * ROWS, n));
    for ds in 0..datasets {
        let rows = ds * ROWS..(ds + 1) * ROWS;
        let cols = GLOBALS + ds * LOCALS..GLOBALS + (ds + 1) * LOCALS;
        jacobian
            .slice_mut(s![rows.clone(), 0..GLOBALS])
            .mapv_inplace(|_: f64| rng.gen_range(-1.0..1.0));
        jacobian
            .slice_mut(s![rows, cols])
            .mapv_inplace(|_: f64| rng.gen_range(-1.0..1.0));
    }

    let mut sizes = vec![GLOBALS];
    sizes.extend(std::iter::repeat(LOCALS).take(datasets));
    let mut abd = ABDMatrix::new(&sizes).expect("valid block sizes");
    abd.set_from_product(jacobian.view())
        .expect("jacobian matches the blocks");
    abd.add_to_diagonal(1.0);
    let rhs = Array1::from_shape_fn(n, |i| (i as f64).sin());
    (abd, rhs)
}

fn bench_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("normal_equations");
    for datasets in [10, 50, 200] {
        let (abd, rhs) = random_problem(datasets);
        let full = abd.expand_to_full_matrix();
        let n = full.nrows();
        let dense = DMatrix::from_fn(n, n, |i, j| full[[i, j]]);
        let b = DVector::from_iterator(n, rhs.iter().copied());

        group.bench_with_input(BenchmarkId::new("abd", datasets), &datasets, |bench, _| {
            bench.iter(|| black_box(abd.solve(rhs.view()).expect("positive definite")))
        });
        group.bench_with_input(BenchmarkId::new("dense_cholesky", datasets), &datasets, |bench, _| {
            bench.iter(|| {
                let chol = dense.clone().cholesky().expect("positive definite");
                black_box(chol.solve(&b))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_solve);
criterion_main!(benches);
