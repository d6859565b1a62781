//! Integration tests for multifit-rs
//!
//! Organized by area, in the same order as the crate is layered.

// Almost-block-diagonal linear algebra
mod linalg;

// Index maps, sparse jacobians and covariances
mod sparse;

// Fits and kinetic models used through the public API
mod integration;

/// Test helpers - common utilities for tests
pub mod test_helpers {
    use ndarray::{s, Array2};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Random jacobian with the sparsity of a multi-dataset fit: the first
    /// `globals` columns are filled for every row, then each dataset owns
    /// `locals[ds]` columns and `rows` rows.
    pub fn random_block_jacobian(globals: usize, locals: &[usize], rows: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n = globals + locals.iter().sum::<usize>();
        let mut jacobian = Array2::zeros((rows * locals.len(), n));
        let mut col = globals;
        for (ds, &count) in locals.iter().enumerate() {
            let r = ds * rows..(ds + 1) * rows;
            jacobian
                .slice_mut(s![r.clone(), 0..globals])
                .mapv_inplace(|_: f64| rng.gen_range(-1.0..1.0));
            jacobian
                .slice_mut(s![r, col..col + count])
                .mapv_inplace(|_: f64| rng.gen_range(-1.0..1.0));
            col += count;
        }
        jacobian
    }

    /// Block sizes matching [`random_block_jacobian`].
    pub fn block_sizes(globals: usize, locals: &[usize]) -> Vec<usize> {
        let mut sizes = vec![globals];
        sizes.extend_from_slice(locals);
        sizes
    }
}
