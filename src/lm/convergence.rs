//! Convergence criteria, iteration status and cooperative cancellation.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State of a fit after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationStatus {
    /// More iterations are needed.
    Running,

    /// Every relative parameter change is below the threshold.
    Converged,

    /// The iteration budget ran out.
    MaxIterationsReached,

    /// The stop flag was raised.
    Stopped,
}

impl IterationStatus {
    /// Returns true if the fit has terminated, successfully or not.
    pub fn is_terminated(&self) -> bool {
        !matches!(self, IterationStatus::Running)
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, IterationStatus::Converged)
    }

    /// Returns a description of the status.
    pub fn description(&self) -> &'static str {
        match self {
            IterationStatus::Running => "Fit is still running",
            IterationStatus::Converged => "Converged: small relative parameter change",
            IterationStatus::MaxIterationsReached => "Terminated: maximum iterations reached",
            IterationStatus::Stopped => "Terminated: stopped on request",
        }
    }
}

/// Largest relative change `|dp| / (relative_min + |p|)` of a step.
pub fn max_relative_change(
    step: ArrayView1<'_, f64>,
    params: ArrayView1<'_, f64>,
    relative_min: f64,
) -> f64 {
    step.iter()
        .zip(params.iter())
        .map(|(dp, p)| dp.abs() / (relative_min + p.abs()))
        .fold(0.0, f64::max)
}

/// Settable flag checked by the engine between iterations.
///
/// Clones share the same flag, so one can be handed to a signal handler or
/// another thread while the fit runs.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the running fit to stop after the current iteration.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
