//! Steady states of kinetic systems held at a given potential.
//!
//! The steady state solves `dC/dt = 0`. These equations are not
//! independent when the total concentration is conserved, so the first
//! one is replaced by `c_tot - Σ C = 0`.

use log::{debug, warn};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FitError, Result};
use crate::parameters::{Expression, SimpleContext};

use super::msolver::{MSolver, RootSolverOptions};
use super::system::KineticSystem;

/// Currents and concentrations along a potential sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voltammogram {
    pub potentials: Array1<f64>,
    pub currents: Array1<f64>,

    /// One array per species, over the potentials
    pub concentrations: Vec<Array1<f64>>,
}

pub struct KineticSystemSteadyState<'a> {
    system: &'a KineticSystem,
    parameters: Vec<f64>,
    potential: usize,
    total: usize,
    solver: MSolver,
}

impl<'a> KineticSystemSteadyState<'a> {
    /// # Errors
    ///
    /// * `FitError::Logic` if the system was not prepared with
    ///   [`KineticSystem::prepare_for_steady_state`]
    pub fn new(system: &'a KineticSystem) -> Result<Self> {
        let index = |name: &str| {
            system.parameter_index(name).ok_or_else(|| {
                FitError::Logic(format!(
                    "parameter '{}' missing, the system is not prepared for steady states",
                    name
                ))
            })
        };
        let potential = index("e")?;
        let total = index("c_tot")?;
        index("temperature")?;
        if system.species_count() == 0 {
            return Err(FitError::InvalidInput(
                "a steady state needs at least one species".to_string(),
            ));
        }
        Ok(Self {
            system,
            parameters: vec![0.0; system.all_parameters().len()],
            potential,
            total,
            solver: MSolver::default(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.system.species_count()
    }

    pub fn set_solver_options(&mut self, options: RootSolverOptions) {
        self.solver = MSolver::new(options);
    }

    /// Sets the parameters found in `values` and returns the names of the
    /// ones not given, sorted.
    pub fn set_parameters(&mut self, values: &HashMap<String, f64>) -> Vec<String> {
        let mut missing = Vec::new();
        for (idx, name) in self.system.all_parameters().iter().enumerate() {
            match values.get(name) {
                Some(&v) => self.parameters[idx] = v,
                None => missing.push(name.clone()),
            }
        }
        missing.sort();
        missing
    }

    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        let idx = self
            .system
            .parameter_index(name)
            .ok_or_else(|| FitError::ParameterNotFound(name.to_string()))?;
        self.parameters[idx] = value;
        Ok(())
    }

    /// Sets parameters from assignments such as `k = 2; c_tot = 1e-3`,
    /// separated by `;` or newlines. A right-hand side may use the
    /// parameters assigned before it.
    pub fn set_parameters_from_str(&mut self, text: &str) -> Result<()> {
        let mut context = SimpleContext::new();
        for assignment in text.split([';', '\n']).map(str::trim).filter(|s| !s.is_empty()) {
            let (name, formula) = assignment.split_once('=').ok_or_else(|| {
                FitError::InvalidInput(format!("expected 'name = value', got '{}'", assignment))
            })?;
            let name = name.trim();
            let value = Expression::parse(formula)?.evaluate(&context)?;
            self.set_parameter(name, value)?;
            context.set_variable(name, value);
        }
        Ok(())
    }

    pub fn parameter_values(&self) -> HashMap<String, f64> {
        self.system
            .all_parameters()
            .iter()
            .cloned()
            .zip(self.parameters.iter().copied())
            .collect()
    }

    /// `dC/dt` at `concentrations`, the first entry replaced by the
    /// conservation constraint.
    pub fn residuals(&self, concentrations: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        let mut out = Array1::zeros(self.dimension());
        self.system
            .compute_derivatives(concentrations, &self.parameters, Some(out.view_mut()))?;
        out[0] = self.parameters[self.total] - concentrations.sum();
        Ok(out)
    }

    /// Current at `concentrations` with the present parameters.
    pub fn current(&self, concentrations: ArrayView1<'_, f64>) -> Result<f64> {
        self.system
            .compute_derivatives(concentrations, &self.parameters, None)
    }

    fn uniform_guess(&self) -> Array1<f64> {
        let n = self.dimension();
        Array1::from_elem(n, self.parameters[self.total] / n as f64)
    }

    /// Steady-state concentrations, starting from `initial` or from equal
    /// concentrations summing to `c_tot`.
    pub fn solve(&self, initial: Option<ArrayView1<'_, f64>>) -> Result<Array1<f64>> {
        if self.parameters[self.total] == 0.0 {
            return Ok(Array1::zeros(self.dimension()));
        }
        let guess = match initial {
            Some(c) if c.len() == self.dimension() => c.to_owned(),
            Some(c) => {
                return Err(FitError::DimensionMismatch(format!(
                    "initial guess has {} entries for {} species",
                    c.len(),
                    self.dimension()
                )))
            }
            None => self.uniform_guess(),
        };
        self.solver.solve(|c| self.residuals(c), guess.view())
    }

    /// Steady states and currents over `potentials`, each solve starting
    /// from the previous solution.
    pub fn compute_voltammogram(&mut self, potentials: &[f64]) -> Result<Voltammogram> {
        let n = self.dimension();
        let mut currents = Array1::zeros(potentials.len());
        let mut concentrations = vec![Array1::zeros(potentials.len()); n];
        let mut previous: Option<Array1<f64>> = None;

        for (i, &e) in potentials.iter().enumerate() {
            self.parameters[self.potential] = e;
            let solution = match self.solve(previous.as_ref().map(|p| p.view())) {
                Ok(s) => s,
                Err(err) if previous.is_some() && err.is_numerical() => {
                    warn!(
                        "steady state at E = {} failed from the previous solution ({}), restarting",
                        e, err
                    );
                    self.solve(None)?
                }
                Err(err) => return Err(err),
            };
            currents[i] = self.current(solution.view())?;
            for (s, col) in concentrations.iter_mut().enumerate() {
                col[i] = solution[s];
            }
            previous = Some(solution);
        }
        debug!("voltammogram over {} potentials", potentials.len());
        Ok(Voltammogram {
            potentials: Array1::from(potentials.to_vec()),
            currents,
            concentrations,
        })
    }
}
