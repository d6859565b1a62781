//! Parameter definitions and free parameters.

use serde::{Deserialize, Serialize};

/// Default relative step for numerical derivatives.
pub const DEFAULT_DERIVATION_FACTOR: f64 = 1e-4;

/// Default lower bound on the absolute derivation step.
pub const DEFAULT_MIN_DERIVATION_STEP: f64 = 1e-8;

/// One named kind of fit parameter, such as `k1` or `E0`.
///
/// A global definition has a single value shared by all the datasets of a
/// fit, a local one gets an independent value per dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Name of the parameter
    pub name: String,

    /// Whether the value is shared by all datasets
    pub global: bool,
}

impl ParameterDefinition {
    /// A parameter shared by every dataset.
    pub fn global(name: &str) -> Self {
        Self {
            name: name.to_string(),
            global: true,
        }
    }

    /// A parameter with one value per dataset.
    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            global: false,
        }
    }
}

/// A scalar actually varied by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeParameter {
    /// Index of the definition in the fit layout
    pub definition: usize,

    /// Dataset owning the parameter, `None` for global parameters
    pub dataset: Option<usize>,

    /// Position in the packed parameter vector
    pub fit_index: usize,

    /// Relative step used for numerical derivatives
    pub derivation_factor: f64,

    /// Smallest absolute derivation step
    pub min_derivation_step: f64,
}

impl FreeParameter {
    pub fn new(definition: usize, dataset: Option<usize>, fit_index: usize) -> Self {
        Self {
            definition,
            dataset,
            fit_index,
            derivation_factor: DEFAULT_DERIVATION_FACTOR,
            min_derivation_step: DEFAULT_MIN_DERIVATION_STEP,
        }
    }

    /// Whether this parameter applies to all datasets.
    pub fn is_global(&self) -> bool {
        self.dataset.is_none()
    }

    /// Whether this parameter takes part in the given dataset.
    pub fn applies_to(&self, dataset: usize) -> bool {
        self.dataset.map_or(true, |ds| ds == dataset)
    }

    /// Forward-difference step for the current value.
    pub fn derivation_step(&self, value: f64) -> f64 {
        let step = self.derivation_factor * value;
        if step.abs() < self.min_derivation_step {
            self.min_derivation_step
        } else {
            step
        }
    }
}
