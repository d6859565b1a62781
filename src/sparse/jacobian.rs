//! Compact storage of the derivative matrix of a multi-dataset fit.
//!
//! In sparse mode, every local definition owns a single column whose
//! dataset segments hold the derivatives with respect to that dataset's
//! instance. In dense mode every free parameter owns a column, but model
//! code still writes through the same per-definition addressing, and the
//! shared column is redistributed by [`SparseJacobian::splice_parameter`].

use log::{debug, trace};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1};
use std::ops::Range;

use super::index_map::ParameterIndexMap;
use crate::abd::ABDMatrix;
use crate::error::{FitError, Result};
use crate::parameters::FitLayout;

/// Derivatives of the residuals, addressed by parameter definition.
#[derive(Debug, Clone)]
pub struct SparseJacobian {
    map: ParameterIndexMap,
    matrix: Array2<f64>,

    /// Definitions already spliced since the last [`clear`](Self::clear)
    spliced: Vec<bool>,
}

impl SparseJacobian {
    /// Creates a zero Jacobian.
    ///
    /// # Arguments
    ///
    /// * `layout` - Parameter partition of the fit
    /// * `dataset_rows` - Number of residuals of each dataset
    /// * `sparse` - Storage mode
    pub fn new(layout: &FitLayout, dataset_rows: &[usize], sparse: bool) -> Result<Self> {
        Ok(Self::from_map(ParameterIndexMap::new(
            layout,
            dataset_rows,
            sparse,
        )?))
    }

    pub fn from_map(map: ParameterIndexMap) -> Self {
        let matrix = Array2::zeros((map.row_count(), map.column_count()));
        let spliced = vec![false; map.definition_count()];
        Self {
            map,
            matrix,
            spliced,
        }
    }

    pub fn index_map(&self) -> &ParameterIndexMap {
        &self.map
    }

    pub fn is_sparse(&self) -> bool {
        self.map.is_sparse()
    }

    /// The physical matrix.
    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    /// Zeroes the matrix and forgets about previous splicing.
    pub fn clear(&mut self) {
        self.matrix.fill(0.0);
        self.spliced.fill(false);
    }

    /// The whole column of definition `def`, `None` if it has no free
    /// instance.
    pub fn parameter_vector(&mut self, def: usize) -> Option<ArrayViewMut1<'_, f64>> {
        let col = self.map.column(def)?;
        Some(self.matrix.column_mut(col))
    }

    /// The rows of dataset `dataset` in the column of definition `def`.
    ///
    /// With `dataset == None` this is [`parameter_vector`](Self::parameter_vector).
    /// Returns `None` when the parameter is fixed for that dataset. In dense
    /// mode, once `def` is spliced, the view points at the column owned by
    /// the dataset's instance.
    pub fn parameter_vector_for(
        &mut self,
        def: usize,
        dataset: Option<usize>,
    ) -> Option<ArrayViewMut1<'_, f64>> {
        let Some(ds) = dataset else {
            return self.parameter_vector(def);
        };
        let (col, rows) = self.segment(def, ds)?;
        Some(self.matrix.slice_mut(s![rows, col]))
    }

    /// Read-only counterpart of [`parameter_vector_for`](Self::parameter_vector_for)
    /// for a given dataset.
    pub fn parameter_segment(&self, def: usize, ds: usize) -> Option<ArrayView1<'_, f64>> {
        let (col, rows) = self.segment(def, ds)?;
        Some(self.matrix.slice(s![rows, col]))
    }

    fn segment(&self, def: usize, ds: usize) -> Option<(usize, Range<usize>)> {
        let fit_index = self.map.fit_index(def, ds)?;
        let col = if !self.map.is_sparse() && self.spliced[def] {
            fit_index
        } else {
            self.map.column(def)?
        };
        Some((col, self.map.row_range(ds)))
    }

    /// Moves the dataset segments of a shared column into the columns owned
    /// by each dataset's instance.
    ///
    /// No-op in sparse mode. In dense mode, segments of datasets in which
    /// `def` is fixed are zeroed.
    ///
    /// # Errors
    ///
    /// * `FitError::Logic` when `def` was already spliced (dense mode only),
    ///   or does not exist
    pub fn splice_parameter(&mut self, def: usize) -> Result<()> {
        if def >= self.map.definition_count() {
            return Err(FitError::Logic(format!("no parameter definition {}", def)));
        }
        if self.map.is_sparse() {
            return Ok(());
        }
        if self.spliced[def] {
            return Err(FitError::Logic(format!(
                "parameter definition {} spliced twice",
                def
            )));
        }
        self.spliced[def] = true;

        let Some(source) = self.map.column(def) else {
            return Ok(());
        };
        for ds in 0..self.map.dataset_count() {
            let target = self.map.fit_index(def, ds);
            if target == Some(source) {
                continue;
            }
            let rows = self.map.row_range(ds);
            if let Some(target) = target {
                let segment = self.matrix.slice(s![rows.clone(), source]).to_owned();
                self.matrix.slice_mut(s![rows.clone(), target]).assign(&segment);
            }
            self.matrix.slice_mut(s![rows, source]).fill(0.0);
        }
        trace!("spliced definition {} from column {}", def, source);
        Ok(())
    }

    /// Splices every definition.
    pub fn splice_all(&mut self) -> Result<()> {
        (0..self.map.definition_count()).try_for_each(|def| self.splice_parameter(def))
    }

    fn check_spliced(&self) -> Result<()> {
        if self.map.is_sparse() {
            return Ok(());
        }
        for def in 0..self.map.definition_count() {
            if self.spliced[def] || self.map.column(def).is_none() {
                continue;
            }
            // Global definitions own a single column anyway
            let local = (0..self.map.dataset_count())
                .filter_map(|ds| self.map.fit_index(def, ds))
                .any(|idx| self.map.owner(idx).1.is_some());
            if local {
                return Err(FitError::Logic(format!(
                    "local parameter definition {} used before splicing",
                    def
                )));
            }
        }
        Ok(())
    }

    fn dot_columns(&self, p: usize, q: usize) -> f64 {
        let Some(rows) = self.map.shared_rows(p, q) else {
            return 0.0;
        };
        let (cp, _) = self.map.free_column(p);
        let (cq, _) = self.map.free_column(q);
        self.matrix
            .slice(s![rows.clone(), cp])
            .dot(&self.matrix.slice(s![rows, cq]))
    }

    /// Derivatives laid out with one column per free parameter.
    pub fn to_dense(&self) -> Result<Array2<f64>> {
        self.check_spliced()?;
        if !self.map.is_sparse() {
            return Ok(self.matrix.clone());
        }
        let n = self.map.free_count();
        let mut dense = Array2::zeros((self.map.row_count(), n));
        for p in 0..n {
            let (col, rows) = self.map.free_column(p);
            dense
                .slice_mut(s![rows.clone(), p])
                .assign(&self.matrix.slice(s![rows, col]));
        }
        Ok(dense)
    }

    /// Computes `JᵗJ` over the free parameters into `target`.
    pub fn compute_jtj(&self, target: &mut Array2<f64>) -> Result<()> {
        self.check_spliced()?;
        let n = self.map.free_count();
        if target.dim() != (n, n) {
            return Err(FitError::DimensionMismatch(format!(
                "JtJ target should be {}x{}, got {:?}",
                n,
                n,
                target.dim()
            )));
        }
        for p in 0..n {
            for q in p..n {
                let v = self.dot_columns(p, q);
                target[[p, q]] = v;
                target[[q, p]] = v;
            }
        }
        Ok(())
    }

    /// Computes `JᵗJ` straight into almost-block-diagonal storage.
    ///
    /// The block sizes of `target` must be those of
    /// [`FitLayout::block_sizes`]; products between local parameters of
    /// distinct datasets vanish and are not computed.
    pub fn compute_jtj_abd(&self, target: &mut ABDMatrix) -> Result<()> {
        self.check_spliced()?;
        let sizes = target.block_sizes().to_vec();
        if target.total_size() != self.map.free_count()
            || sizes.len() != self.map.dataset_count() + 1
        {
            return Err(FitError::DimensionMismatch(format!(
                "block sizes {:?} do not match {} free parameters over {} datasets",
                sizes,
                self.map.free_count(),
                self.map.dataset_count()
            )));
        }

        let n0 = sizes[0];
        for p in 0..n0 {
            for q in p..n0 {
                let v = self.dot_columns(p, q);
                let mut d0 = target.diag_block_mut(0);
                d0[[p, q]] = v;
                d0[[q, p]] = v;
            }
        }
        for b in 1..sizes.len() {
            let off = target.block_offset(b);
            let nb = sizes[b];
            for i in 0..nb {
                for j in i..nb {
                    let v = self.dot_columns(off + i, off + j);
                    let mut db = target.diag_block_mut(b);
                    db[[i, j]] = v;
                    db[[j, i]] = v;
                }
            }
            let coupling = Array2::from_shape_fn((n0, nb), |(g, j)| self.dot_columns(g, off + j));
            target.set_coupling_block(b, coupling.view())?;
        }
        Ok(())
    }

    /// Computes `factor × Jᵗ func`, one entry per free parameter.
    pub fn compute_gradient(&self, func: ArrayView1<'_, f64>, factor: f64) -> Result<Array1<f64>> {
        self.check_spliced()?;
        if func.len() != self.map.row_count() {
            return Err(FitError::DimensionMismatch(format!(
                "function has {} rows, jacobian {}",
                func.len(),
                self.map.row_count()
            )));
        }
        Ok(Array1::from_shape_fn(self.map.free_count(), |p| {
            let (col, rows) = self.map.free_column(p);
            factor
                * self
                    .matrix
                    .slice(s![rows.clone(), col])
                    .dot(&func.slice(s![rows]))
        }))
    }

    /// Adds `factor × other` to this Jacobian.
    pub fn add_jacobian(&mut self, other: &SparseJacobian, factor: f64) -> Result<()> {
        if self.map != other.map {
            return Err(FitError::DimensionMismatch(
                "cannot add jacobians of different parameter layouts".to_string(),
            ));
        }
        self.matrix.scaled_add(factor, &other.matrix);
        debug!("added jacobian with factor {:e}", factor);
        Ok(())
    }
}
