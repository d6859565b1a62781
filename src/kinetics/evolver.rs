//! Time evolution of a [`KineticSystem`] by numerical integration.

use log::debug;
use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use peroxide::fuga::ODEProblem;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::{FitError, Result};

use super::ode::{OdeStepper, OdeStepperOptions};
use super::system::KineticSystem;

/// Hook run before every derivative evaluation, with the parameter values
/// and the time; it may change time-dependent parameters.
pub type ParameterCallback<'a> = Box<dyn FnMut(&mut [f64], f64) + 'a>;

/// Right-hand side of the rate equations seen by the integrator.
///
/// The callback may rewrite parameters before each evaluation, hence the
/// interior mutability behind the `&self` receiver.
struct KineticRhs<'s, 'a> {
    system: &'s KineticSystem,
    parameters: RefCell<&'s mut Vec<f64>>,
    callback: RefCell<Option<&'s mut ParameterCallback<'a>>>,
}

impl ODEProblem for KineticRhs<'_, '_> {
    fn rhs(&self, t: f64, y: &[f64], dy: &mut [f64]) -> anyhow::Result<()> {
        let mut parameters = self.parameters.borrow_mut();
        if let Some(cb) = self.callback.borrow_mut().as_deref_mut() {
            cb(parameters.as_mut_slice(), t);
        }
        self.system.compute_derivatives(
            ArrayView1::from(y),
            parameters.as_slice(),
            Some(ArrayViewMut1::from(dy)),
        )?;
        Ok(())
    }
}

/// Integrates the concentrations of a kinetic system over time.
///
/// # Example
///
/// ```
/// use multifit_rs::kinetics::{KineticSystem, KineticSystemEvolver};
/// use std::collections::HashMap;
///
/// let system = KineticSystem::parse("A ->[k] B").unwrap();
/// let mut evolver = KineticSystemEvolver::new(&system);
/// let values = HashMap::from([("k".to_string(), 1.0), ("c0_A".to_string(), 1.0)]);
/// let missing = evolver.set_parameters(&values);
/// assert_eq!(missing, vec!["c0_B".to_string()]);
///
/// evolver.initialize(0.0).unwrap();
/// evolver.step_to(1.0).unwrap();
/// assert!((evolver.concentrations()[0] - (-1.0f64).exp()).abs() < 1e-5);
/// ```
pub struct KineticSystemEvolver<'a> {
    system: &'a KineticSystem,
    parameters: Vec<f64>,
    parameter_index: HashMap<String, usize>,
    callback: Option<ParameterCallback<'a>>,

    stepper: OdeStepper,
    t: f64,
    y: Array1<f64>,
}

impl<'a> KineticSystemEvolver<'a> {
    /// An evolver with every parameter set to 0.
    pub fn new(system: &'a KineticSystem) -> Self {
        let parameter_index = system
            .all_parameters()
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            system,
            parameters: vec![0.0; system.all_parameters().len()],
            parameter_index,
            callback: None,
            stepper: OdeStepper::new(OdeStepperOptions::default()),
            t: 0.0,
            y: Array1::zeros(system.species_count()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.system.species_count()
    }

    pub fn set_stepper_options(&mut self, options: OdeStepperOptions) {
        self.stepper.set_options(options);
    }

    pub fn stepper_options(&self) -> &OdeStepperOptions {
        self.stepper.options()
    }

    /// Sets the parameters found in `values`, ignoring unknown names.
    ///
    /// Returns the names of the parameters that were not given, sorted.
    pub fn set_parameters(&mut self, values: &HashMap<String, f64>) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for (name, &idx) in &self.parameter_index {
            match values.get(name) {
                Some(&v) => self.parameters[idx] = v,
                None => missing.push(name.clone()),
            }
        }
        missing.sort();
        missing
    }

    /// Sets all parameters from `source`, in the order of
    /// [`KineticSystem::all_parameters`], except the one at `skip`, which
    /// `source` does not contain.
    ///
    /// # Errors
    ///
    /// * `FitError::Logic` if `skip` is not a parameter index
    /// * `FitError::DimensionMismatch` if `source` has the wrong length
    pub fn set_parameters_from_slice(&mut self, source: &[f64], skip: Option<usize>) -> Result<()> {
        if let Some(idx) = skip.filter(|&i| i >= self.parameters.len()) {
            return Err(FitError::Logic(format!(
                "cannot skip parameter {}, the system has {}",
                idx,
                self.parameters.len()
            )));
        }
        let expected = self.parameters.len() - usize::from(skip.is_some());
        if source.len() != expected {
            return Err(FitError::DimensionMismatch(format!(
                "expected {} parameter values, got {}",
                expected,
                source.len()
            )));
        }
        let mut values = source.iter();
        for (i, p) in self.parameters.iter_mut().enumerate() {
            if Some(i) == skip {
                continue;
            }
            if let Some(&v) = values.next() {
                *p = v;
            }
        }
        Ok(())
    }

    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        let idx = self
            .parameter_index(name)
            .ok_or_else(|| FitError::ParameterNotFound(name.to_string()))?;
        self.parameters[idx] = value;
        Ok(())
    }

    pub fn parameter_values(&self) -> HashMap<String, f64> {
        self.parameter_index
            .iter()
            .map(|(name, &idx)| (name.clone(), self.parameters[idx]))
            .collect()
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameter_index.get(name).copied()
    }

    /// Installs a hook run before each derivative evaluation.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut [f64], f64) + 'a,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Feeds the time to the parameter `name` during integration.
    pub fn track_time(&mut self, name: &str) -> Result<()> {
        let idx = self
            .parameter_index(name)
            .ok_or_else(|| FitError::ParameterNotFound(name.to_string()))?;
        self.set_callback(move |params, t| params[idx] = t);
        Ok(())
    }

    /// Resets the concentrations to the `c0_*` parameters at time `t0`.
    pub fn initialize(&mut self, t0: f64) -> Result<()> {
        self.system
            .initial_concentrations(&self.parameters, self.y.view_mut())?;
        self.stepper.reset();
        self.t = t0;
        Ok(())
    }

    pub fn current_time(&self) -> f64 {
        self.t
    }

    pub fn concentrations(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }

    /// Integrates up to time `to`.
    pub fn step_to(&mut self, to: f64) -> Result<()> {
        let rhs = KineticRhs {
            system: self.system,
            parameters: RefCell::new(&mut self.parameters),
            callback: RefCell::new(self.callback.as_mut()),
        };
        self.stepper.apply(&rhs, &mut self.t, to, &mut self.y)
    }

    /// Integrates through `t_values` and returns the concentrations there,
    /// one array per species.
    pub fn steps(&mut self, t_values: &[f64]) -> Result<Vec<Array1<f64>>> {
        let n = self.dimension();
        let mut out = vec![Array1::zeros(t_values.len()); n];
        for (i, &t) in t_values.iter().enumerate() {
            self.step_to(t)?;
            for (s, col) in out.iter_mut().enumerate() {
                col[i] = self.y[s];
            }
        }
        debug!("integrated {} species over {} points", n, t_values.len());
        Ok(out)
    }
}
