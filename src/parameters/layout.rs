//! Partition of the parameters of a multi-dataset fit.
//!
//! A [`FitLayout`] unrolls the parameter definitions across datasets into
//! the list of [`FreeParameter`]s the optimizer varies. Free parameters are
//! numbered globals first, then the free locals of dataset 0, of dataset 1,
//! and so on. That order makes the normal equations almost block diagonal
//! with no permutation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::definition::{FreeParameter, ParameterDefinition};
use crate::error::{FitError, Result};

/// Parameter definitions, datasets and the free/fixed partition of a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitLayout {
    definitions: Vec<ParameterDefinition>,
    datasets: usize,

    /// Free parameters, sorted by fit index
    free: Vec<FreeParameter>,

    /// Fit index of each `(definition, dataset)` pair, at `def * datasets + ds`
    fit_indices: Vec<Option<usize>>,

    global_free: usize,
    local_free: Vec<usize>,
}

/// Builder for [`FitLayout`].
#[derive(Debug, Clone, Default)]
pub struct FitLayoutBuilder {
    datasets: usize,
    definitions: Vec<ParameterDefinition>,
    fixed: Vec<(String, Option<usize>)>,
}

impl FitLayoutBuilder {
    /// Adds a parameter shared by every dataset.
    pub fn global(mut self, name: &str) -> Self {
        self.definitions.push(ParameterDefinition::global(name));
        self
    }

    /// Adds a parameter with one value per dataset.
    pub fn local(mut self, name: &str) -> Self {
        self.definitions.push(ParameterDefinition::local(name));
        self
    }

    /// Adds an already-formed definition.
    pub fn definition(mut self, def: ParameterDefinition) -> Self {
        self.definitions.push(def);
        self
    }

    /// Fixes a parameter, in one dataset or (with `None`) in all of them.
    ///
    /// Global parameters can only be fixed as a whole.
    pub fn fix(mut self, name: &str, dataset: Option<usize>) -> Self {
        self.fixed.push((name.to_string(), dataset));
        self
    }

    pub fn build(self) -> Result<FitLayout> {
        let n_defs = self.definitions.len();
        let n_ds = self.datasets;
        if n_ds == 0 {
            return Err(FitError::InvalidInput(
                "a fit needs at least one dataset".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for def in &self.definitions {
            if !seen.insert(def.name.as_str()) {
                return Err(FitError::InvalidInput(format!(
                    "parameter '{}' defined twice",
                    def.name
                )));
            }
        }

        let mut fixed = vec![false; n_defs * n_ds];
        for (name, dataset) in &self.fixed {
            let def = self
                .definitions
                .iter()
                .position(|d| &d.name == name)
                .ok_or_else(|| FitError::ParameterNotFound(name.clone()))?;
            match dataset {
                None => fixed[def * n_ds..(def + 1) * n_ds].fill(true),
                Some(ds) if *ds >= n_ds => {
                    return Err(FitError::InvalidInput(format!(
                        "cannot fix '{}' in dataset {}, there are only {}",
                        name, ds, n_ds
                    )))
                }
                Some(_) if self.definitions[def].global => {
                    return Err(FitError::InvalidInput(format!(
                        "global parameter '{}' cannot be fixed in a single dataset",
                        name
                    )))
                }
                Some(ds) => fixed[def * n_ds + ds] = true,
            }
        }

        let mut free = Vec::new();
        let mut fit_indices = vec![None; n_defs * n_ds];

        for (def, d) in self.definitions.iter().enumerate() {
            if d.global && !fixed[def * n_ds] {
                let idx = free.len();
                free.push(FreeParameter::new(def, None, idx));
                fit_indices[def * n_ds..(def + 1) * n_ds].fill(Some(idx));
            }
        }
        let global_free = free.len();

        let mut local_free = vec![0; n_ds];
        for (ds, count) in local_free.iter_mut().enumerate() {
            for (def, d) in self.definitions.iter().enumerate() {
                if !d.global && !fixed[def * n_ds + ds] {
                    let idx = free.len();
                    free.push(FreeParameter::new(def, Some(ds), idx));
                    fit_indices[def * n_ds + ds] = Some(idx);
                    *count += 1;
                }
            }
        }

        Ok(FitLayout {
            definitions: self.definitions,
            datasets: n_ds,
            free,
            fit_indices,
            global_free,
            local_free,
        })
    }
}

impl FitLayout {
    /// Starts a layout over `datasets` datasets.
    ///
    /// # Examples
    ///
    /// ```
    /// use multifit_rs::parameters::FitLayout;
    ///
    /// let layout = FitLayout::builder(2).global("E0").local("k").build().unwrap();
    /// assert_eq!(layout.free_count(), 3);
    /// ```
    pub fn builder(datasets: usize) -> FitLayoutBuilder {
        FitLayoutBuilder {
            datasets,
            ..Default::default()
        }
    }

    pub fn definitions(&self) -> &[ParameterDefinition] {
        &self.definitions
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets
    }

    /// Index of the definition called `name`.
    pub fn definition_index(&self, name: &str) -> Option<usize> {
        self.definitions.iter().position(|d| d.name == name)
    }

    /// All free parameters, in fit-index order.
    pub fn free_parameters(&self) -> &[FreeParameter] {
        &self.free
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of free global parameters.
    pub fn global_free_count(&self) -> usize {
        self.global_free
    }

    /// Number of free local parameters of dataset `ds`.
    pub fn local_free_count(&self, ds: usize) -> usize {
        self.local_free[ds]
    }

    /// Fit index of definition `def` for dataset `ds`, `None` if fixed.
    pub fn fit_index(&self, def: usize, ds: usize) -> Option<usize> {
        if def >= self.definitions.len() || ds >= self.datasets {
            return None;
        }
        self.fit_indices[def * self.datasets + ds]
    }

    /// Whether definition `def` is fixed in dataset `ds`.
    pub fn is_fixed(&self, def: usize, ds: usize) -> bool {
        self.fit_index(def, ds).is_none()
    }

    /// Free parameters belonging to one definition.
    pub fn free_for_definition(&self, def: usize) -> impl Iterator<Item = &FreeParameter> + '_ {
        self.free.iter().filter(move |p| p.definition == def)
    }

    /// Free parameters that take part in dataset `ds`, globals included.
    pub fn free_for_dataset(&self, ds: usize) -> impl Iterator<Item = &FreeParameter> + '_ {
        self.free.iter().filter(move |p| p.applies_to(ds))
    }

    /// Block sizes of the normal equations: free globals, then the free
    /// locals of each dataset.
    pub fn block_sizes(&self) -> Vec<usize> {
        std::iter::once(self.global_free)
            .chain(self.local_free.iter().copied())
            .collect()
    }

    /// Length of the unpacked parameter array, `datasets × definitions`.
    pub fn unpacked_len(&self) -> usize {
        self.datasets * self.definitions.len()
    }

    /// Sets the derivation factor of every free instance of `def`.
    pub fn set_derivation_factor(&mut self, def: usize, factor: f64) {
        for p in self.free.iter_mut().filter(|p| p.definition == def) {
            p.derivation_factor = factor;
        }
    }
}
