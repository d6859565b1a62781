//! Fit data: model, datasets, parameter layout and the packed vector.
//!
//! The optimizer works on a *packed* vector holding only the free
//! parameters, in fit-index order. The model sees *unpacked* values, one
//! slot per `(dataset, definition)` at `dataset × definitions + definition`,
//! where fixed parameters keep the values given to
//! [`FitData::set_values`].

use log::debug;
use ndarray::{s, Array1, Array2, ArrayView1};
use std::cell::Cell;

use crate::error::{FitError, Result};
use crate::parameters::FitLayout;
use crate::problem::{Dataset, MultiFitModel};
use crate::sparse::SparseJacobian;

/// Step factor used to probe the linearity of the parameters.
const LINEARITY_STEP_FACTOR: f64 = 1e5;

/// Everything a multi-dataset fit needs to evaluate residuals and derivatives.
#[derive(Debug)]
pub struct FitData<M> {
    model: M,
    datasets: Vec<Dataset>,
    layout: FitLayout,
    rows: Vec<usize>,

    /// Unpacked values; fixed parameters are read from there
    values: Vec<f64>,

    evaluations: Cell<usize>,
}

impl<M: MultiFitModel> FitData<M> {
    /// Creates fit data with all parameter values set to zero.
    ///
    /// # Errors
    ///
    /// * `FitError::InvalidInput` if the number of datasets does not match
    ///   the layout
    pub fn new(model: M, datasets: Vec<Dataset>, layout: FitLayout) -> Result<Self> {
        if datasets.len() != layout.dataset_count() {
            return Err(FitError::InvalidInput(format!(
                "layout expects {} datasets, got {}",
                layout.dataset_count(),
                datasets.len()
            )));
        }
        let rows = datasets.iter().map(Dataset::nb_rows).collect();
        let values = vec![0.0; layout.unpacked_len()];
        Ok(Self {
            model,
            datasets,
            layout,
            rows,
            values,
            evaluations: Cell::new(0),
        })
    }

    /// Sets the unpacked values: initial guesses of free parameters and
    /// values of fixed ones.
    pub fn set_values(&mut self, unpacked: &[f64]) -> Result<()> {
        if unpacked.len() != self.values.len() {
            return Err(FitError::DimensionMismatch(format!(
                "expected {} unpacked values, got {}",
                self.values.len(),
                unpacked.len()
            )));
        }
        self.values.copy_from_slice(unpacked);
        Ok(())
    }

    /// Sets one unpacked value; `None` sets it for all datasets.
    pub fn set_value(&mut self, name: &str, dataset: Option<usize>, value: f64) -> Result<()> {
        let def = self
            .layout
            .definition_index(name)
            .ok_or_else(|| FitError::ParameterNotFound(name.to_string()))?;
        let n_defs = self.layout.definition_count();
        match dataset {
            Some(ds) if ds < self.datasets.len() => self.values[ds * n_defs + def] = value,
            Some(ds) => {
                return Err(FitError::InvalidInput(format!(
                    "no dataset {} in a fit over {}",
                    ds,
                    self.datasets.len()
                )))
            }
            None => {
                for ds in 0..self.datasets.len() {
                    self.values[ds * n_defs + def] = value;
                }
            }
        }
        Ok(())
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn layout(&self) -> &FitLayout {
        &self.layout
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Number of residuals of each dataset.
    pub fn dataset_rows(&self) -> &[usize] {
        &self.rows
    }

    /// Total number of residuals.
    pub fn data_points(&self) -> usize {
        self.rows.iter().sum()
    }

    pub fn free_count(&self) -> usize {
        self.layout.free_count()
    }

    /// Number of model evaluations (per dataset) so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations.get()
    }

    /// Rows of dataset `ds` in a residual-sized vector.
    pub fn view_for_dataset<'a>(&self, ds: usize, v: ArrayView1<'a, f64>) -> ArrayView1<'a, f64> {
        let start: usize = self.rows[..ds].iter().sum();
        v.slice_move(s![start..start + self.rows[ds]])
    }

    /// Extracts the free parameters from unpacked values.
    pub fn pack(&self, unpacked: &[f64]) -> Result<Array1<f64>> {
        if unpacked.len() != self.values.len() {
            return Err(FitError::DimensionMismatch(format!(
                "expected {} unpacked values, got {}",
                self.values.len(),
                unpacked.len()
            )));
        }
        let n_defs = self.layout.definition_count();
        Ok(self
            .layout
            .free_parameters()
            .iter()
            .map(|p| unpacked[p.dataset.unwrap_or(0) * n_defs + p.definition])
            .collect())
    }

    /// Packed vector of the current values.
    pub fn initial_guess(&self) -> Array1<f64> {
        let n_defs = self.layout.definition_count();
        self.layout
            .free_parameters()
            .iter()
            .map(|p| self.values[p.dataset.unwrap_or(0) * n_defs + p.definition])
            .collect()
    }

    /// Expands a packed vector, fixed parameters taken from the stored values.
    pub fn unpack(&self, packed: ArrayView1<'_, f64>) -> Result<Vec<f64>> {
        if packed.len() != self.layout.free_count() {
            return Err(FitError::DimensionMismatch(format!(
                "expected {} free parameters, got {}",
                self.layout.free_count(),
                packed.len()
            )));
        }
        let n_defs = self.layout.definition_count();
        let mut unpacked = self.values.clone();
        for p in self.layout.free_parameters() {
            let value = packed[p.fit_index];
            match p.dataset {
                Some(ds) => unpacked[ds * n_defs + p.definition] = value,
                None => {
                    for ds in 0..self.datasets.len() {
                        unpacked[ds * n_defs + p.definition] = value;
                    }
                }
            }
        }
        Ok(unpacked)
    }

    fn dataset_params<'a>(&self, unpacked: &'a [f64], ds: usize) -> &'a [f64] {
        let n_defs = self.layout.definition_count();
        &unpacked[ds * n_defs..(ds + 1) * n_defs]
    }

    fn model_for_dataset(&self, unpacked: &[f64], ds: usize, target: &mut Array1<f64>) -> Result<()> {
        self.evaluations.set(self.evaluations.get() + 1);
        let dataset = &self.datasets[ds];
        self.model.function_for_dataset(
            self.dataset_params(unpacked, ds),
            dataset,
            ds,
            target.view_mut(),
        )?;
        if target.iter().any(|v| !v.is_finite()) {
            return Err(FitError::FunctionEvaluation(format!(
                "non-finite model value in dataset '{}'",
                dataset.name
            )));
        }
        Ok(())
    }

    /// Model values over all datasets, from unpacked values.
    pub fn compute_model(&self, unpacked: &[f64]) -> Result<Array1<f64>> {
        let mut out = Array1::zeros(self.data_points());
        let mut start = 0;
        for ds in 0..self.datasets.len() {
            let mut buf = Array1::zeros(self.rows[ds]);
            self.model_for_dataset(unpacked, ds, &mut buf)?;
            out.slice_mut(s![start..start + self.rows[ds]]).assign(&buf);
            start += self.rows[ds];
        }
        Ok(out)
    }

    /// Residuals (model minus data) at a packed parameter vector.
    pub fn compute_residuals(&self, packed: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        let unpacked = self.unpack(packed)?;
        let mut f = self.compute_model(&unpacked)?;
        let mut start = 0;
        for ds in &self.datasets {
            let mut seg = f.slice_mut(s![start..start + ds.nb_rows()]);
            seg -= &ds.y;
            start += ds.nb_rows();
        }
        Ok(f)
    }

    /// A zero Jacobian matching this fit.
    pub fn new_jacobian(&self, sparse: bool) -> Result<SparseJacobian> {
        SparseJacobian::new(&self.layout, &self.rows, sparse)
    }

    /// Fills `jacobian` with the derivatives of the residuals at `packed`.
    ///
    /// Analytic derivatives are used when the model has them; otherwise
    /// forward differences, with the step of each free parameter scaled by
    /// `step_factor`. Only the datasets a parameter takes part in are
    /// re-evaluated. The Jacobian is spliced on return.
    pub fn compute_jacobian(
        &self,
        packed: ArrayView1<'_, f64>,
        jacobian: &mut SparseJacobian,
        step_factor: f64,
    ) -> Result<()> {
        let map = jacobian.index_map();
        if map.free_count() != self.free_count() || map.row_count() != self.data_points() {
            return Err(FitError::DimensionMismatch(
                "jacobian does not match the fit data".to_string(),
            ));
        }
        jacobian.clear();
        let unpacked = self.unpack(packed)?;
        let n_defs = self.layout.definition_count();

        if self.model.has_analytic_derivatives() {
            for (ds, dataset) in self.datasets.iter().enumerate() {
                let mut d = Array2::zeros((self.rows[ds], n_defs));
                self.model.derivatives_for_dataset(
                    self.dataset_params(&unpacked, ds),
                    dataset,
                    ds,
                    d.view_mut(),
                )?;
                for def in 0..n_defs {
                    if let Some(mut col) = jacobian.parameter_vector_for(def, Some(ds)) {
                        col.assign(&d.column(def));
                    }
                }
            }
            return jacobian.splice_all();
        }

        let mut base = Vec::with_capacity(self.datasets.len());
        for ds in 0..self.datasets.len() {
            let mut buf = Array1::zeros(self.rows[ds]);
            self.model_for_dataset(&unpacked, ds, &mut buf)?;
            base.push(buf);
        }

        let mut perturbed = packed.to_owned();
        for p in self.layout.free_parameters() {
            let value = packed[p.fit_index];
            let step = p.derivation_step(value) * step_factor;
            perturbed[p.fit_index] = value + step;
            let shifted = self.unpack(perturbed.view())?;
            perturbed[p.fit_index] = value;

            for ds in (0..self.datasets.len()).filter(|&ds| p.applies_to(ds)) {
                let mut buf = Array1::zeros(self.rows[ds]);
                self.model_for_dataset(&shifted, ds, &mut buf)?;
                buf -= &base[ds];
                buf /= step;
                if let Some(mut col) = jacobian.parameter_vector_for(p.definition, Some(ds)) {
                    col.assign(&buf);
                }
            }
        }
        jacobian.splice_all()
    }

    /// Finds the parameters on which the model depends linearly.
    ///
    /// Derivatives computed with a step `1e5` times larger than usual are
    /// compared with the normal ones; a `(definition, dataset)` pair is linear
    /// when the norm of the difference is below `threshold` times the norm
    /// of its derivative.
    pub fn find_linear_parameters(
        &self,
        packed: ArrayView1<'_, f64>,
        threshold: f64,
    ) -> Result<Vec<(usize, usize)>> {
        let mut j1 = self.new_jacobian(true)?;
        let mut j2 = self.new_jacobian(true)?;
        self.compute_jacobian(packed, &mut j1, 1.0)?;
        self.compute_jacobian(packed, &mut j2, LINEARITY_STEP_FACTOR)?;
        j2.add_jacobian(&j1, -1.0)?;

        let norm = |v: ArrayView1<'_, f64>| v.dot(&v).sqrt();
        let mut linear = Vec::new();
        for ds in 0..self.datasets.len() {
            for def in 0..self.layout.definition_count() {
                let (Some(v1), Some(v2)) =
                    (j1.parameter_segment(def, ds), j2.parameter_segment(def, ds))
                else {
                    continue;
                };
                let (n1, n2) = (norm(v1), norm(v2));
                if n1 > 0.0 && n2 < n1 * threshold {
                    linear.push((def, ds));
                }
            }
        }
        debug!("linear parameters: {:?}", linear);
        Ok(linear)
    }
}
