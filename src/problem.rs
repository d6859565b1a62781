//! Datasets and the model trait of multi-dataset fits.
//!
//! A [`MultiFitModel`] computes model values for one dataset at a time, from
//! that dataset's own parameter values (one per definition of the
//! [`FitLayout`](crate::parameters::FitLayout), globals included). It may
//! provide analytic derivatives; otherwise forward finite differences are
//! used by [`FitData`](crate::fitdata::FitData).

use ndarray::{Array1, ArrayView1, ArrayViewMut1, ArrayViewMut2};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// One fitted curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Name used in diagnostics
    pub name: String,

    /// Abscissae
    pub x: Array1<f64>,

    /// Values to fit
    pub y: Array1<f64>,
}

impl Dataset {
    /// Creates a dataset; `x` and `y` must have the same length.
    pub fn new(name: &str, x: Array1<f64>, y: Array1<f64>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(FitError::DimensionMismatch(format!(
                "dataset '{}' has {} x values and {} y values",
                name,
                x.len(),
                y.len()
            )));
        }
        Ok(Self {
            name: name.to_string(),
            x,
            y,
        })
    }

    /// Number of residuals this dataset contributes.
    pub fn nb_rows(&self) -> usize {
        self.x.len()
    }
}

/// A model fitted simultaneously to several datasets.
pub trait MultiFitModel {
    /// Computes the model values for one dataset.
    ///
    /// # Arguments
    ///
    /// * `params` - Values of every parameter definition for this dataset
    /// * `dataset` - The dataset, mostly for its `x` values
    /// * `index` - Position of the dataset in the fit
    /// * `target` - Where to write the `dataset.nb_rows()` model values
    fn function_for_dataset(
        &self,
        params: &[f64],
        dataset: &Dataset,
        index: usize,
        target: ArrayViewMut1<'_, f64>,
    ) -> Result<()>;

    /// Whether [`derivatives_for_dataset`](Self::derivatives_for_dataset) is implemented.
    fn has_analytic_derivatives(&self) -> bool {
        false
    }

    /// Computes the derivatives of the model values of one dataset with
    /// respect to every parameter definition, one column per definition.
    fn derivatives_for_dataset(
        &self,
        _params: &[f64],
        _dataset: &Dataset,
        _index: usize,
        _target: ArrayViewMut2<'_, f64>,
    ) -> Result<()> {
        Err(FitError::FunctionEvaluation(
            "this model does not provide analytic derivatives".to_string(),
        ))
    }
}

/// A model defined by a closure of the dataset parameters and abscissae.
#[derive(Debug, Clone, Copy)]
pub struct FnModel<F>(F);

/// Wraps a closure `(params, x, target)` as a [`MultiFitModel`].
pub fn model_fn<F>(f: F) -> FnModel<F>
where
    F: Fn(&[f64], ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>) -> Result<()>,
{
    FnModel(f)
}

impl<F> MultiFitModel for FnModel<F>
where
    F: Fn(&[f64], ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>) -> Result<()>,
{
    fn function_for_dataset(
        &self,
        params: &[f64],
        dataset: &Dataset,
        _index: usize,
        target: ArrayViewMut1<'_, f64>,
    ) -> Result<()> {
        (self.0)(params, dataset.x.view(), target)
    }
}
