//! # Covariance Matrix Lookup
//!
//! Post-fit covariance, stored either as a dense matrix over the free
//! parameters or as the almost-block-diagonal inverse of the normal
//! equations, and read through logical `(definition, dataset)` indices.

use ndarray::{Array1, Array2};

use super::index_map::ParameterIndexMap;
use crate::abd::ABDMatrix;
use crate::error::{FitError, Result};
use crate::parameters::FitLayout;

#[derive(Debug, Clone)]
enum Storage {
    Dense(Array2<f64>),
    Blocks(ABDMatrix),
}

/// Read-only covariance of the free parameters of a fit.
#[derive(Debug, Clone)]
pub struct SparseCovariance {
    map: ParameterIndexMap,
    storage: Storage,
}

impl SparseCovariance {
    /// Wraps a dense `free × free` covariance matrix.
    pub fn from_dense(layout: &FitLayout, covariance: Array2<f64>) -> Result<Self> {
        let n = layout.free_count();
        if covariance.dim() != (n, n) {
            return Err(FitError::DimensionMismatch(format!(
                "covariance should be {}x{}, got {:?}",
                n,
                n,
                covariance.dim()
            )));
        }
        let map = ParameterIndexMap::new(layout, &vec![0; layout.dataset_count()], false)?;
        Ok(Self {
            map,
            storage: Storage::Dense(covariance),
        })
    }

    /// Wraps an almost-block-diagonal covariance, laid out as
    /// [`FitLayout::block_sizes`].
    pub fn from_blocks(layout: &FitLayout, covariance: ABDMatrix) -> Result<Self> {
        if covariance.block_sizes() != layout.block_sizes().as_slice() {
            return Err(FitError::DimensionMismatch(format!(
                "covariance blocks {:?} do not match the layout {:?}",
                covariance.block_sizes(),
                layout.block_sizes()
            )));
        }
        let map = ParameterIndexMap::new(layout, &vec![0; layout.dataset_count()], true)?;
        Ok(Self {
            map,
            storage: Storage::Blocks(covariance),
        })
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.storage, Storage::Blocks(_))
    }

    pub fn index_map(&self) -> &ParameterIndexMap {
        &self.map
    }

    /// Entry between two free parameters, by fit index.
    pub fn get_free(&self, p: usize, q: usize) -> Result<f64> {
        match &self.storage {
            Storage::Dense(m) => m.get((p, q)).copied().ok_or_else(|| {
                FitError::Logic(format!("free parameter index ({}, {}) out of range", p, q))
            }),
            Storage::Blocks(abd) => abd.get(p, q),
        }
    }

    /// Entry between two logical parameters `definition × datasets + dataset`.
    ///
    /// Fixed parameters have a zero covariance with everything. A global
    /// parameter gives the same value whatever the dataset part of its
    /// logical index. Between local parameters of distinct datasets, the
    /// almost-block-diagonal storage answers zero.
    pub fn get(&self, i: usize, j: usize) -> Result<f64> {
        match (self.map.resolve(i)?, self.map.resolve(j)?) {
            (Some(p), Some(q)) => self.get_free(p, q),
            _ => Ok(0.0),
        }
    }

    /// Variance of `(def, ds)`, zero if fixed.
    pub fn variance(&self, def: usize, ds: usize) -> Result<f64> {
        let i = self.map.logical_index(def, ds);
        self.get(i, i)
    }

    /// Square roots of the diagonal, one per free parameter.
    pub fn standard_errors(&self) -> Array1<f64> {
        Array1::from_shape_fn(self.map.free_count(), |p| {
            let v = self.get_free(p, p).unwrap_or(0.0);
            if v > 0.0 {
                v.sqrt()
            } else {
                0.0
            }
        })
    }

    /// Dense `free × free` matrix.
    pub fn to_dense(&self) -> Array2<f64> {
        match &self.storage {
            Storage::Dense(m) => m.clone(),
            Storage::Blocks(abd) => abd.expand_to_full_matrix(),
        }
    }
}

/// Correlation matrix of a covariance matrix.
///
/// `correl[i,j] = covar[i,j] / sqrt(covar[i,i] * covar[j,j])`, with 1 on
/// the diagonal and 0 where a variance vanishes.
pub fn correlation_matrix(covar: &Array2<f64>) -> Array2<f64> {
    Array2::from_shape_fn(covar.dim(), |(i, j)| {
        if i == j {
            return 1.0;
        }
        let denom = (covar[[i, i]] * covar[[j, j]]).sqrt();
        if denom > 0.0 {
            covar[[i, j]] / denom
        } else {
            0.0
        }
    })
}

/// Standard errors from the diagonal of a covariance matrix.
pub fn standard_errors(covar: &Array2<f64>) -> Array1<f64> {
    covar
        .diag()
        .mapv(|v| if v > 0.0 { v.sqrt() } else { 0.0 })
}
