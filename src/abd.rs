//! Almost-block-diagonal symmetric matrices.
//!
//! An [`ABDMatrix`] has one dense *global* block coupled to N dense *local*
//! blocks which are not coupled to each other:
//!
//! ```text
//! | D0  T1  T2  ... TN |
//! | L1  D1   0  ...  0 |
//! | L2   0  D2  ...  0 |
//! | ..  ..  ..  ... .. |
//! | LN   0   0  ... DN |
//! ```
//!
//! with `Li = Tiᵗ`. This is the shape of the normal equations `JᵗJ + λI` of a
//! fit over N datasets sharing global parameters while each keeps private
//! local ones. Solving goes through the Schur complement of the global
//! block, so the cost grows linearly with the number of datasets instead of
//! cubically with the total size.

use log::{debug, warn};
use nalgebra::{linalg::Cholesky, DMatrix, DVector, Dyn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut2};

use crate::error::{FitError, Result};
use crate::utils::matrix_convert::{
    nalgebra_to_ndarray, nalgebra_vec_to_ndarray, ndarray_to_nalgebra, ndarray_vec_to_nalgebra,
};

/// Relative magnitude above which a discarded off-pattern entry is reported.
const DISCARD_TOLERANCE: f64 = 1e-12;

/// Symmetric almost-block-diagonal matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct ABDMatrix {
    /// Block sizes, `sizes[0]` being the global block
    sizes: Vec<usize>,

    /// Offset of each block in the full matrix
    offsets: Vec<usize>,

    /// Diagonal blocks
    diag: Vec<Array2<f64>>,

    /// Coupling blocks `global × local(i)`; `top[0]` is an empty placeholder
    top: Vec<Array2<f64>>,

    /// Coupling blocks `local(i) × global`, transposes of `top`
    left: Vec<Array2<f64>>,
}

/// Factored form of an [`ABDMatrix`], shared by solve and the inverses.
struct BlockFactorization {
    /// Cholesky factor of each local block and `Di⁻¹ Li`; `None` for empty blocks
    locals: Vec<Option<(Cholesky<f64, Dyn>, DMatrix<f64>)>>,

    /// Cholesky factor of the Schur complement of the global block
    schur: Option<Cholesky<f64, Dyn>>,
}

impl ABDMatrix {
    /// Creates a zero matrix with the given block sizes.
    ///
    /// # Arguments
    ///
    /// * `sizes` - `sizes[0]` is the size of the global block, the following
    ///   entries the sizes of the local blocks. Zero-sized blocks are allowed.
    ///
    /// # Errors
    ///
    /// * `FitError::InvalidInput` if `sizes` is empty
    pub fn new(sizes: &[usize]) -> Result<Self> {
        if sizes.is_empty() {
            return Err(FitError::InvalidInput(
                "an almost-block-diagonal matrix needs at least the global block".to_string(),
            ));
        }

        let mut offsets = Vec::with_capacity(sizes.len());
        let mut total = 0;
        for &sz in sizes {
            offsets.push(total);
            total += sz;
        }

        let n0 = sizes[0];
        let diag = sizes.iter().map(|&sz| Array2::zeros((sz, sz))).collect();
        let mut top = Vec::with_capacity(sizes.len());
        let mut left = Vec::with_capacity(sizes.len());
        top.push(Array2::zeros((0, 0)));
        left.push(Array2::zeros((0, 0)));
        for &sz in &sizes[1..] {
            top.push(Array2::zeros((n0, sz)));
            left.push(Array2::zeros((sz, n0)));
        }

        Ok(Self {
            sizes: sizes.to_vec(),
            offsets,
            diag,
            top,
            left,
        })
    }

    /// Sum of all block sizes.
    pub fn total_size(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// Block sizes, global block first.
    pub fn block_sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Number of blocks, including the global one.
    pub fn block_count(&self) -> usize {
        self.sizes.len()
    }

    /// Offset of block `block` in the full matrix.
    pub fn block_offset(&self, block: usize) -> usize {
        self.offsets[block]
    }

    /// Mutable access to a diagonal block.
    pub fn diag_block_mut(&mut self, block: usize) -> ArrayViewMut2<'_, f64> {
        self.diag[block].view_mut()
    }

    /// A diagonal block.
    pub fn diag_block(&self, block: usize) -> ArrayView2<'_, f64> {
        self.diag[block].view()
    }

    /// The `global × local(block)` coupling block.
    pub fn coupling_block(&self, block: usize) -> ArrayView2<'_, f64> {
        self.top[block].view()
    }

    /// Sets the `global × local(block)` coupling block and its transpose.
    pub fn set_coupling_block(&mut self, block: usize, values: ArrayView2<'_, f64>) -> Result<()> {
        if block == 0 || block >= self.sizes.len() {
            return Err(FitError::Logic(format!(
                "no coupling block {} in a matrix with {} blocks",
                block,
                self.sizes.len()
            )));
        }
        if values.dim() != self.top[block].dim() {
            return Err(FitError::DimensionMismatch(format!(
                "coupling block {} is {:?}, got {:?}",
                block,
                self.top[block].dim(),
                values.dim()
            )));
        }
        self.top[block].assign(&values);
        self.left[block].assign(&values.t());
        Ok(())
    }

    /// Adds `value` to every diagonal entry.
    pub fn add_to_diagonal(&mut self, value: f64) {
        for block in &mut self.diag {
            block.diag_mut().mapv_inplace(|d| d + value);
        }
    }

    /// Multiplies every stored entry by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for m in self
            .diag
            .iter_mut()
            .chain(self.top.iter_mut())
            .chain(self.left.iter_mut())
        {
            *m *= factor;
        }
    }

    /// Zeroes every stored entry.
    pub fn clear(&mut self) {
        for m in self
            .diag
            .iter_mut()
            .chain(self.top.iter_mut())
            .chain(self.left.iter_mut())
        {
            m.fill(0.0);
        }
    }

    /// Copies the contents of a matrix with the same block structure.
    pub fn copy_from(&mut self, other: &ABDMatrix) -> Result<()> {
        if self.sizes != other.sizes {
            return Err(FitError::Logic(format!(
                "cannot copy block structure {:?} into {:?}",
                other.sizes, self.sizes
            )));
        }
        self.diag.clone_from(&other.diag);
        self.top.clone_from(&other.top);
        self.left.clone_from(&other.left);
        Ok(())
    }

    /// Finds the block holding full-matrix index `index`, and the index within it.
    fn locate(&self, index: usize) -> Option<(usize, usize)> {
        // Zero-sized blocks share their offset with the next one, hence the
        // size check
        (0..self.sizes.len())
            .rev()
            .find(|&b| self.sizes[b] > 0 && self.offsets[b] <= index)
            .filter(|&b| index < self.offsets[b] + self.sizes[b])
            .map(|b| (b, index - self.offsets[b]))
    }

    fn check_index(&self, i: usize, j: usize) -> Result<((usize, usize), (usize, usize))> {
        match (self.locate(i), self.locate(j)) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(FitError::Logic(format!(
                "index ({}, {}) out of a matrix of size {}",
                i,
                j,
                self.total_size()
            ))),
        }
    }

    /// Returns element `(i, j)` of the full matrix; zero outside the pattern.
    pub fn get(&self, i: usize, j: usize) -> Result<f64> {
        let ((bi, li), (bj, lj)) = self.check_index(i, j)?;
        Ok(match (bi, bj) {
            _ if bi == bj => self.diag[bi][[li, lj]],
            (0, _) => self.top[bj][[li, lj]],
            (_, 0) => self.left[bi][[li, lj]],
            _ => 0.0,
        })
    }

    /// Sets element `(i, j)` and its symmetric counterpart.
    ///
    /// # Errors
    ///
    /// * `FitError::Logic` for indices out of range, or between two distinct
    ///   local blocks (structural zeros)
    pub fn set(&mut self, i: usize, j: usize, value: f64) -> Result<()> {
        let ((bi, li), (bj, lj)) = self.check_index(i, j)?;
        match (bi, bj) {
            _ if bi == bj => {
                self.diag[bi][[li, lj]] = value;
                self.diag[bi][[lj, li]] = value;
            }
            (0, _) => {
                self.top[bj][[li, lj]] = value;
                self.left[bj][[lj, li]] = value;
            }
            (_, 0) => {
                self.left[bi][[li, lj]] = value;
                self.top[bi][[lj, li]] = value;
            }
            _ => {
                return Err(FitError::Logic(format!(
                    "({}, {}) couples local blocks {} and {}",
                    i, j, bi, bj
                )))
            }
        }
        Ok(())
    }

    /// Fills the matrix with the in-pattern blocks of `JᵗJ`.
    ///
    /// `jacobian` is the Jacobian of the full problem, with one column per
    /// row of this matrix. Products between distinct local blocks are not
    /// kept; debug builds compute them anyway and log the ones that do not
    /// vanish.
    pub fn set_from_product(&mut self, jacobian: ArrayView2<'_, f64>) -> Result<()> {
        let n = self.total_size();
        if jacobian.ncols() != n {
            return Err(FitError::DimensionMismatch(format!(
                "expected a jacobian with {} columns, got {}",
                n,
                jacobian.ncols()
            )));
        }

        let n0 = self.sizes[0];
        let global = jacobian.slice(s![.., 0..n0]);
        self.diag[0] = global.t().dot(&global);
        for b in 1..self.sizes.len() {
            let off = self.offsets[b];
            let local = jacobian.slice(s![.., off..off + self.sizes[b]]);
            self.diag[b] = local.t().dot(&local);
            self.top[b] = global.t().dot(&local);
            self.left[b] = self.top[b].t().to_owned();
        }
        if cfg!(debug_assertions) {
            let discarded = self.count_off_pattern_products(jacobian);
            if discarded > 0 {
                debug!("{} products between distinct local blocks discarded", discarded);
            }
        }
        Ok(())
    }

    /// Fills the matrix from an already-formed full Gram matrix.
    ///
    /// Off-pattern entries are dropped; the number of those that were not
    /// negligible is returned, and logged as a warning, since for a genuine
    /// almost-block-diagonal problem they must all vanish.
    pub fn set_from_gram(&mut self, gram: ArrayView2<'_, f64>) -> Result<usize> {
        let n = self.total_size();
        if gram.dim() != (n, n) {
            return Err(FitError::DimensionMismatch(format!(
                "expected a {}x{} matrix, got {:?}",
                n,
                n,
                gram.dim()
            )));
        }

        let n0 = self.sizes[0];
        self.diag[0].assign(&gram.slice(s![0..n0, 0..n0]));
        for b in 1..self.sizes.len() {
            let off = self.offsets[b];
            let end = off + self.sizes[b];
            self.diag[b].assign(&gram.slice(s![off..end, off..end]));
            self.top[b].assign(&gram.slice(s![0..n0, off..end]));
            self.left[b].assign(&gram.slice(s![off..end, 0..n0]));
        }

        let discarded = self.count_off_pattern(gram);
        if discarded > 0 {
            warn!(
                "{} entries between distinct local blocks were discarded",
                discarded
            );
        }
        Ok(discarded)
    }

    /// Entries of `gram` between distinct local blocks that are not
    /// negligible relative to its largest entry.
    fn count_off_pattern(&self, gram: ArrayView2<'_, f64>) -> usize {
        let scale = gram.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let threshold = DISCARD_TOLERANCE * scale;
        let mut discarded = 0;
        for bi in 1..self.sizes.len() {
            for bj in 1..self.sizes.len() {
                if bi == bj {
                    continue;
                }
                let (oi, oj) = (self.offsets[bi], self.offsets[bj]);
                discarded += gram
                    .slice(s![oi..oi + self.sizes[bi], oj..oj + self.sizes[bj]])
                    .iter()
                    .filter(|v| v.abs() > threshold)
                    .count();
            }
        }
        discarded
    }

    /// Same count as [`count_off_pattern`](Self::count_off_pattern) for
    /// `jacobianᵗ·jacobian`, without forming it: only the rows shared by
    /// two local blocks can contribute, and each pair of blocks is
    /// multiplied over those rows alone.
    fn count_off_pattern_products(&self, jacobian: ArrayView2<'_, f64>) -> usize {
        let spans: Vec<Option<(usize, usize)>> = (0..self.sizes.len())
            .map(|b| {
                let off = self.offsets[b];
                let columns = jacobian.slice(s![.., off..off + self.sizes[b]]);
                let mut used = columns
                    .rows()
                    .into_iter()
                    .enumerate()
                    .filter(|(_, row)| row.iter().any(|v| *v != 0.0))
                    .map(|(i, _)| i);
                let first = used.next()?;
                Some((first, used.last().unwrap_or(first) + 1))
            })
            .collect();

        // The largest entry of a Gram matrix sits on its diagonal
        let scale = self
            .diag
            .iter()
            .flat_map(|d| d.diag().to_vec())
            .fold(0.0_f64, f64::max);
        let threshold = DISCARD_TOLERANCE * scale;

        let mut discarded = 0;
        for bi in 1..self.sizes.len() {
            for bj in bi + 1..self.sizes.len() {
                let (Some((lo_i, hi_i)), Some((lo_j, hi_j))) = (spans[bi], spans[bj]) else {
                    continue;
                };
                let (lo, hi) = (lo_i.max(lo_j), hi_i.min(hi_j));
                if lo >= hi {
                    continue;
                }
                let (oi, oj) = (self.offsets[bi], self.offsets[bj]);
                let ci = jacobian.slice(s![lo..hi, oi..oi + self.sizes[bi]]);
                let cj = jacobian.slice(s![lo..hi, oj..oj + self.sizes[bj]]);
                // Both triangles of the Gram matrix
                discarded += 2 * ci
                    .t()
                    .dot(&cj)
                    .iter()
                    .filter(|v| v.abs() > threshold)
                    .count();
            }
        }
        discarded
    }

    /// Builds the full dense symmetric matrix.
    pub fn expand_to_full_matrix(&self) -> Array2<f64> {
        let n = self.total_size();
        let n0 = self.sizes[0];
        let mut full = Array2::zeros((n, n));
        full.slice_mut(s![0..n0, 0..n0]).assign(&self.diag[0]);
        for b in 1..self.sizes.len() {
            let off = self.offsets[b];
            let end = off + self.sizes[b];
            full.slice_mut(s![off..end, off..end]).assign(&self.diag[b]);
            full.slice_mut(s![0..n0, off..end]).assign(&self.top[b]);
            full.slice_mut(s![off..end, 0..n0]).assign(&self.left[b]);
        }
        full
    }

    /// Factors the local blocks and the Schur complement of the global block.
    fn factorize(&self) -> Result<BlockFactorization> {
        let n0 = self.sizes[0];
        let mut schur = ndarray_to_nalgebra(self.diag[0].view());
        let mut locals = Vec::with_capacity(self.sizes.len());
        locals.push(None);

        for b in 1..self.sizes.len() {
            if self.sizes[b] == 0 {
                locals.push(None);
                continue;
            }
            let chol = Cholesky::new(ndarray_to_nalgebra(self.diag[b].view()))
                .ok_or_else(|| FitError::singular(b, "local block is not positive definite"))?;
            let left = ndarray_to_nalgebra(self.left[b].view());
            let reduced = chol.solve(&left);
            if n0 > 0 {
                schur -= left.transpose() * &reduced;
            }
            locals.push(Some((chol, reduced)));
        }

        let schur = if n0 > 0 {
            Some(Cholesky::new(schur).ok_or_else(|| {
                FitError::singular(0, "reduced global block is not positive definite")
            })?)
        } else {
            None
        };

        Ok(BlockFactorization { locals, schur })
    }

    /// Applies a factorization to one right-hand side.
    fn solve_factored(&self, fact: &BlockFactorization, rhs: ArrayView1<'_, f64>) -> Array1<f64> {
        let n0 = self.sizes[0];
        let mut r0 = ndarray_vec_to_nalgebra(rhs.slice(s![0..n0]));
        let mut local_rhs = Vec::with_capacity(self.sizes.len());
        local_rhs.push(DVector::zeros(0));

        // Forward elimination of the local blocks
        for b in 1..self.sizes.len() {
            let off = self.offsets[b];
            let bi = ndarray_vec_to_nalgebra(rhs.slice(s![off..off + self.sizes[b]]));
            if let Some((_, reduced)) = &fact.locals[b] {
                if n0 > 0 {
                    r0 -= reduced.transpose() * &bi;
                }
            }
            local_rhs.push(bi);
        }

        let x0 = match &fact.schur {
            Some(chol) => chol.solve(&r0),
            None => DVector::zeros(0),
        };

        // Back-substitution
        let mut x = Array1::zeros(self.total_size());
        x.slice_mut(s![0..n0]).assign(&nalgebra_vec_to_ndarray(&x0));
        for b in 1..self.sizes.len() {
            if let Some((chol, reduced)) = &fact.locals[b] {
                let mut xi = chol.solve(&local_rhs[b]);
                if n0 > 0 {
                    xi -= reduced * &x0;
                }
                let off = self.offsets[b];
                x.slice_mut(s![off..off + self.sizes[b]])
                    .assign(&nalgebra_vec_to_ndarray(&xi));
            }
        }
        x
    }

    /// Solves `A x = rhs` by block elimination.
    ///
    /// # Errors
    ///
    /// * `FitError::DimensionMismatch` if `rhs` has the wrong length
    /// * `FitError::SingularMatrix` naming the first block that could not be
    ///   factored (0 for the reduced global block)
    pub fn solve(&self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        if rhs.len() != self.total_size() {
            return Err(FitError::DimensionMismatch(format!(
                "right-hand side has {} entries, matrix size is {}",
                rhs.len(),
                self.total_size()
            )));
        }
        let fact = self.factorize()?;
        Ok(self.solve_factored(&fact, rhs))
    }

    /// Full dense inverse, computed one column at a time.
    pub fn invert(&self) -> Result<Array2<f64>> {
        let n = self.total_size();
        let fact = self.factorize()?;
        let mut inverse = Array2::zeros((n, n));
        let mut unit = Array1::zeros(n);
        for j in 0..n {
            unit[j] = 1.0;
            let col = self.solve_factored(&fact, unit.view());
            inverse.column_mut(j).assign(&col);
            unit[j] = 0.0;
        }
        Ok(inverse)
    }

    /// Inverse restricted to the almost-block-diagonal pattern.
    ///
    /// Only the blocks that an [`ABDMatrix`] can store are computed, which is
    /// all a covariance lookup needs: local parameters of different datasets
    /// are correlated through the global block but nobody asks for those
    /// entries.
    pub fn almost_invert(&self) -> Result<ABDMatrix> {
        let fact = self.factorize()?;
        let n0 = self.sizes[0];
        let mut result = ABDMatrix::new(&self.sizes)?;

        let schur_inv = match &fact.schur {
            Some(chol) => chol.inverse(),
            None => DMatrix::zeros(0, 0),
        };
        result.diag[0] = nalgebra_to_ndarray(&schur_inv);

        for b in 1..self.sizes.len() {
            if let Some((chol, reduced)) = &fact.locals[b] {
                // (A⁻¹)_bb = Db⁻¹ + Wb S⁻¹ Wbᵗ, (A⁻¹)_b0 = -Wb S⁻¹
                let mut block = chol.inverse();
                if n0 > 0 {
                    let cross = -(reduced * &schur_inv);
                    block -= &cross * reduced.transpose();
                    result.left[b] = nalgebra_to_ndarray(&cross);
                    result.top[b] = nalgebra_to_ndarray(&cross.transpose());
                }
                result.diag[b] = nalgebra_to_ndarray(&block);
            }
        }
        debug!("computed almost inverse of blocks {:?}", self.sizes);
        Ok(result)
    }
}
