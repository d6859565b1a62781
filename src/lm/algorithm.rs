//! Levenberg-Marquardt iterations over several datasets at once.
//!
//! The engine owns the parameter vector and the work buffers of a fit. Every
//! iteration computes the residuals and the Jacobian once, then tries the
//! damping `λ` and `λ / scale` and keeps the better of the two steps. When
//! neither decreases the residuals, `λ` grows until one does.

use log::{debug, info, trace, warn};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FitError, Result};
use crate::fitdata::FitData;
use crate::problem::MultiFitModel;
use crate::sparse::{SparseCovariance, SparseJacobian};

use super::config::MultiFitConfig;
use super::convergence::{max_relative_change, IterationStatus, StopFlag};
use super::normal::NormalEquations;

/// What happened during one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationDiagnostics {
    pub iteration: usize,

    /// Norm of the residuals after the step
    pub residuals: f64,

    /// Damping parameter after the step
    pub lambda: f64,

    /// Number of times lambda was increased before a step was accepted
    pub tries: usize,

    /// Largest relative parameter change of the accepted step
    pub relative_change: f64,
}

/// Outcome of a fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    /// Final values, one per (definition, dataset) pair
    pub values: Vec<f64>,

    /// Final free parameters, in fit order
    pub parameters: Array1<f64>,

    /// Standard errors of the free parameters, in fit order
    pub errors: Array1<f64>,

    /// Norm of the residuals at the solution
    pub residuals: f64,

    /// Sum of squared residuals divided by the degrees of freedom
    pub reduced_chi_square: f64,

    pub iterations: usize,

    /// Number of model evaluations over the whole fit
    pub evaluations: usize,

    pub status: IterationStatus,

    pub message: String,

    pub diagnostics: Vec<IterationDiagnostics>,

    /// Covariance of the free parameters, if it could be computed
    #[serde(skip)]
    pub covariance: Option<SparseCovariance>,
}

impl FitReport {
    pub fn success(&self) -> bool {
        self.status.is_converged()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for FitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fit Result:")?;
        writeln!(f, "  Success: {}", self.success())?;
        writeln!(f, "  Message: {}", self.message)?;
        writeln!(f, "  Residuals: {:.6e}", self.residuals)?;
        writeln!(f, "  Reduced chi-square: {:.6e}", self.reduced_chi_square)?;
        writeln!(f, "  Iterations: {}", self.iterations)?;
        writeln!(f, "  Function evaluations: {}", self.evaluations)?;
        for (p, e) in self.parameters.iter().zip(self.errors.iter()) {
            writeln!(f, "    {:.8e} +/- {:.3e}", p, e)?;
        }
        Ok(())
    }
}

/// Levenberg-Marquardt engine for a multi-dataset fit.
///
/// # Example
///
/// ```
/// use multifit_rs::{model_fn, Dataset, FitData, FitLayout, MultiFitConfig, MultiFitEngine};
/// use ndarray::Array1;
///
/// let x = Array1::linspace(0.0, 4.0, 20);
/// let datasets = vec![
///     Dataset::new("fast", x.clone(), x.mapv(|x| 2.0 * (-1.5 * x).exp())).unwrap(),
///     Dataset::new("slow", x.clone(), x.mapv(|x| 2.0 * (-0.5 * x).exp())).unwrap(),
/// ];
/// let layout = FitLayout::builder(2).global("a").local("k").build().unwrap();
/// let model = model_fn(|p: &[f64], x, mut y| {
///     y.assign(&x.mapv(|x| p[0] * (-p[1] * x).exp()));
///     Ok(())
/// });
/// let mut data = FitData::new(model, datasets, layout).unwrap();
/// data.set_values(&[1.0, 1.0, 1.0, 1.0]).unwrap();
///
/// let mut engine = MultiFitEngine::new(&data, MultiFitConfig::default()).unwrap();
/// let report = engine.run().unwrap();
/// assert!(report.success());
/// assert!((report.values[1] - 1.5).abs() < 1e-4);
/// ```
pub struct MultiFitEngine<'a, M> {
    data: &'a FitData<M>,
    config: MultiFitConfig,
    stop: StopFlag,

    parameters: Array1<f64>,
    function: Array1<f64>,
    jacobian: SparseJacobian,
    gradient: Array1<f64>,
    jtj: NormalEquations,
    damped: NormalEquations,

    lambda: f64,
    residuals: f64,
    iterations: usize,
    diagnostics: Vec<IterationDiagnostics>,
}

impl<'a, M: MultiFitModel> MultiFitEngine<'a, M> {
    /// Sets up a fit starting from the current values of `data`.
    pub fn new(data: &'a FitData<M>, config: MultiFitConfig) -> Result<Self> {
        let layout = data.layout();
        let parameters = data.initial_guess();
        let function = data.compute_residuals(parameters.view())?;
        let residuals = function.dot(&function).sqrt();
        debug!(
            "starting {} fit of {} free parameters over {} points, residuals {:e}",
            if config.sparse { "sparse" } else { "dense" },
            layout.free_count(),
            data.data_points(),
            residuals
        );
        Ok(Self {
            jacobian: data.new_jacobian(config.sparse)?,
            gradient: Array1::zeros(layout.free_count()),
            jtj: NormalEquations::new(layout, config.sparse)?,
            damped: NormalEquations::new(layout, config.sparse)?,
            lambda: config.lambda,
            data,
            config,
            stop: StopFlag::new(),
            parameters,
            function,
            residuals,
            iterations: 0,
            diagnostics: Vec::new(),
        })
    }

    /// Uses `stop` to cancel [`run`](Self::run) from elsewhere.
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Restarts from the given packed parameters.
    pub fn with_initial_guess(mut self, packed: ArrayView1<'_, f64>) -> Result<Self> {
        if packed.len() != self.parameters.len() {
            return Err(FitError::DimensionMismatch(format!(
                "expected {} free parameters, got {}",
                self.parameters.len(),
                packed.len()
            )));
        }
        self.parameters.assign(&packed);
        self.function = self.data.compute_residuals(packed)?;
        self.residuals = self.function.dot(&self.function).sqrt();
        Ok(self)
    }

    pub fn config(&self) -> &MultiFitConfig {
        &self.config
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    /// Current free parameters, in fit order.
    pub fn parameters(&self) -> ArrayView1<'_, f64> {
        self.parameters.view()
    }

    /// Current values, one per (definition, dataset) pair.
    pub fn values(&self) -> Result<Vec<f64>> {
        self.data.unpack(self.parameters.view())
    }

    /// Norm of the current residuals.
    pub fn residuals(&self) -> f64 {
        self.residuals
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn diagnostics(&self) -> &[IterationDiagnostics] {
        &self.diagnostics
    }

    /// Solves `(JᵗJ + λ I) δ = -Jᵗf` and evaluates the residuals there.
    fn trial_step(&mut self, lambda: f64) -> Result<(Array1<f64>, f64)> {
        self.damped.copy_from(&self.jtj)?;
        self.damped.add_to_diagonal(lambda);
        let delta = self.damped.solve(self.gradient.view())?;
        let candidate = &self.parameters + &delta;
        let f = self.data.compute_residuals(candidate.view())?;
        let squares = f.dot(&f);
        if !squares.is_finite() {
            return Err(FitError::ConvergenceFailure(format!(
                "non-finite residuals for lambda = {:e}",
                lambda
            )));
        }
        trace!("trial step with lambda {:e}: {:e}", lambda, squares);
        Ok((candidate, squares))
    }

    /// Trial steps failing this way just count as bad steps.
    fn recoverable(err: &FitError) -> bool {
        err.is_numerical() || matches!(err, FitError::FunctionEvaluation(_))
    }

    /// Runs one iteration.
    ///
    /// # Errors
    ///
    /// * `FitError::ConvergenceFailure` when no step decreased the residuals
    ///   after `max_step_tries` increases of lambda
    /// * errors of the model or the linear algebra that are not numerical
    pub fn iterate(&mut self) -> Result<IterationStatus> {
        self.iterations += 1;
        self.data
            .compute_jacobian(self.parameters.view(), &mut self.jacobian, 1.0)?;
        self.gradient = self.jacobian.compute_gradient(self.function.view(), -1.0)?;
        self.jtj.fill(&self.jacobian)?;

        let current = self.function.dot(&self.function);
        let scale = self.config.scale;
        let mut tries = 0;
        let accepted = loop {
            let (first, second) = match self.trial_step(self.lambda) {
                Ok(first) => match self.trial_step(self.lambda / scale) {
                    Ok(second) => (Some(first), Some(second)),
                    Err(e) if Self::recoverable(&e) => (None, None),
                    Err(e) => return Err(e),
                },
                Err(e) if Self::recoverable(&e) => {
                    debug!("trial step failed: {}", e);
                    self.lambda *= scale;
                    (None, None)
                }
                Err(e) => return Err(e),
            };

            match (first, second) {
                (_, Some((p, s))) if s < current => {
                    self.lambda /= scale;
                    break p;
                }
                (Some((p, s)), _) if s <= current => break p,
                _ => {
                    tries += 1;
                    if tries > self.config.max_step_tries {
                        return Err(FitError::ConvergenceFailure(format!(
                            "no step decreased the residuals after {} tries (lambda = {:e})",
                            self.config.max_step_tries, self.lambda
                        )));
                    }
                    self.lambda *= scale;
                }
            }
        };

        let step = &accepted - &self.parameters;
        let change = max_relative_change(step.view(), accepted.view(), self.config.relative_min);
        self.parameters = accepted;
        self.function = self.data.compute_residuals(self.parameters.view())?;
        self.residuals = self.function.dot(&self.function).sqrt();

        self.diagnostics.push(IterationDiagnostics {
            iteration: self.iterations,
            residuals: self.residuals,
            lambda: self.lambda,
            tries,
            relative_change: change,
        });
        debug!(
            "iteration {}: residuals {:e}, lambda {:e}, change {:e}",
            self.iterations, self.residuals, self.lambda, change
        );

        if change <= self.config.end_threshold {
            Ok(IterationStatus::Converged)
        } else {
            Ok(IterationStatus::Running)
        }
    }

    /// Recomputes the Jacobian at the current parameters.
    pub fn recompute_jacobian(&mut self) -> Result<()> {
        self.data
            .compute_jacobian(self.parameters.view(), &mut self.jacobian, 1.0)?;
        self.jtj.fill(&self.jacobian)
    }

    /// Sum of squared residuals per degree of freedom.
    pub fn reduced_chi_square(&self) -> f64 {
        let dof = self
            .data
            .data_points()
            .saturating_sub(self.parameters.len())
            .max(1);
        self.residuals * self.residuals / dof as f64
    }

    /// Covariance of the free parameters at the current point.
    ///
    /// This is `(JᵗJ)⁻¹` scaled by the reduced chi-square. In sparse mode
    /// only the almost-block-diagonal part is computed.
    pub fn covariance(&mut self) -> Result<SparseCovariance> {
        self.recompute_jacobian()?;
        self.jtj.covariance(
            self.data.layout(),
            self.config.svd_tolerance,
            self.reduced_chi_square(),
        )
    }

    /// Iterates until convergence, the iteration limit or a stop request.
    ///
    /// The stop flag is checked between iterations. A failure to compute the
    /// covariance is not fatal: the report then has zero errors.
    pub fn run(&mut self) -> Result<FitReport> {
        let mut status = IterationStatus::Running;
        while !status.is_terminated() {
            status = if self.stop.is_set() {
                IterationStatus::Stopped
            } else if self.iterations >= self.config.max_iterations {
                IterationStatus::MaxIterationsReached
            } else {
                self.iterate()?
            };
        }
        info!(
            "fit finished after {} iterations: {}",
            self.iterations,
            status.description()
        );

        let covariance = match self.covariance() {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("could not compute the covariance matrix: {}", e);
                None
            }
        };
        let errors = covariance
            .as_ref()
            .map(|c| c.standard_errors())
            .unwrap_or_else(|| Array1::zeros(self.parameters.len()));

        Ok(FitReport {
            values: self.values()?,
            parameters: self.parameters.clone(),
            errors,
            residuals: self.residuals,
            reduced_chi_square: self.reduced_chi_square(),
            iterations: self.iterations,
            evaluations: self.data.evaluations(),
            status,
            message: status.description().to_string(),
            diagnostics: self.diagnostics.clone(),
            covariance,
        })
    }
}
