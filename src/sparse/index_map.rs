//! Logical to physical index translation.
//!
//! A *logical* parameter index is `definition × datasets + dataset`; global
//! definitions answer with the same free parameter whatever the dataset.
//! The *physical* index is the column of a [`SparseJacobian`] (or the row of
//! a covariance matrix) that holds the parameter.
//!
//! [`SparseJacobian`]: super::SparseJacobian

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{FitError, Result};
use crate::parameters::FitLayout;

/// Shared bookkeeping of the sparse structures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterIndexMap {
    sparse: bool,
    datasets: usize,
    definitions: usize,

    /// Fit index at `def * datasets + ds`
    fit_indices: Vec<Option<usize>>,

    /// `(definition, dataset)` of each free parameter
    owners: Vec<(usize, Option<usize>)>,

    /// Physical column of each definition: the shared column in sparse
    /// mode, the column of its first free instance in dense mode
    columns: Vec<Option<usize>>,

    column_count: usize,

    /// Row offsets of the datasets, plus the total row count
    row_offsets: Vec<usize>,
}

impl ParameterIndexMap {
    /// Builds the map for a layout.
    ///
    /// # Arguments
    ///
    /// * `layout` - Parameter partition of the fit
    /// * `dataset_rows` - Number of residuals of each dataset
    /// * `sparse` - Whether local definitions share one column across datasets
    pub fn new(layout: &FitLayout, dataset_rows: &[usize], sparse: bool) -> Result<Self> {
        let datasets = layout.dataset_count();
        if dataset_rows.len() != datasets {
            return Err(FitError::DimensionMismatch(format!(
                "layout has {} datasets, got row counts for {}",
                datasets,
                dataset_rows.len()
            )));
        }
        let definitions = layout.definition_count();

        let mut fit_indices = Vec::with_capacity(definitions * datasets);
        for def in 0..definitions {
            for ds in 0..datasets {
                fit_indices.push(layout.fit_index(def, ds));
            }
        }

        let owners = layout
            .free_parameters()
            .iter()
            .map(|p| (p.definition, p.dataset))
            .collect();

        let mut columns = vec![None; definitions];
        let mut column_count = 0;
        for (def, column) in columns.iter_mut().enumerate() {
            let first = layout.free_for_definition(def).map(|p| p.fit_index).min();
            if let Some(first) = first {
                *column = Some(if sparse { column_count } else { first });
                column_count += 1;
            }
        }
        if !sparse {
            column_count = layout.free_count();
        }

        let mut row_offsets = Vec::with_capacity(datasets + 1);
        let mut total = 0;
        row_offsets.push(0);
        for &rows in dataset_rows {
            total += rows;
            row_offsets.push(total);
        }

        Ok(Self {
            sparse,
            datasets,
            definitions,
            fit_indices,
            owners,
            columns,
            column_count,
            row_offsets,
        })
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets
    }

    pub fn definition_count(&self) -> usize {
        self.definitions
    }

    /// Number of free parameters.
    pub fn free_count(&self) -> usize {
        self.owners.len()
    }

    /// Total number of residuals.
    pub fn row_count(&self) -> usize {
        self.row_offsets[self.datasets]
    }

    /// Number of physical columns.
    pub fn column_count(&self) -> usize {
        self.column_count
    }

    /// Residual rows of dataset `ds`.
    pub fn row_range(&self, ds: usize) -> Range<usize> {
        self.row_offsets[ds]..self.row_offsets[ds + 1]
    }

    /// Logical index of `(def, ds)`.
    pub fn logical_index(&self, def: usize, ds: usize) -> usize {
        def * self.datasets + ds
    }

    /// Fit index of `(def, ds)`, `None` when fixed or out of range.
    pub fn fit_index(&self, def: usize, ds: usize) -> Option<usize> {
        if def >= self.definitions || ds >= self.datasets {
            return None;
        }
        self.fit_indices[def * self.datasets + ds]
    }

    /// Fit index of a logical index.
    ///
    /// # Errors
    ///
    /// * `FitError::Logic` when the logical index is out of range
    pub fn resolve(&self, logical: usize) -> Result<Option<usize>> {
        self.fit_indices.get(logical).copied().ok_or_else(|| {
            FitError::Logic(format!(
                "logical index {} out of {} definitions x {} datasets",
                logical, self.definitions, self.datasets
            ))
        })
    }

    /// Physical column of definition `def`, if it has a free instance.
    pub fn column(&self, def: usize) -> Option<usize> {
        self.columns.get(def).copied().flatten()
    }

    /// Definition and dataset of a free parameter.
    pub fn owner(&self, fit_index: usize) -> (usize, Option<usize>) {
        self.owners[fit_index]
    }

    /// Physical column and rows holding the derivatives of a free parameter
    /// once all columns are spliced.
    pub fn free_column(&self, fit_index: usize) -> (usize, Range<usize>) {
        let (def, ds) = self.owners[fit_index];
        if !self.sparse {
            return (fit_index, 0..self.row_count());
        }
        // Every free parameter has a column in sparse mode
        let col = self.columns[def].unwrap_or(0);
        match ds {
            Some(ds) => (col, self.row_range(ds)),
            None => (col, 0..self.row_count()),
        }
    }

    /// Rows over which two free parameters can both have non-zero
    /// derivatives; `None` for locals of different datasets.
    pub fn shared_rows(&self, p: usize, q: usize) -> Option<Range<usize>> {
        match (self.owners[p].1, self.owners[q].1) {
            (Some(a), Some(b)) if a != b => None,
            (Some(ds), _) | (_, Some(ds)) => Some(self.row_range(ds)),
            (None, None) => Some(0..self.row_count()),
        }
    }
}
