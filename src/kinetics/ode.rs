//! Integration of `dy/dt = f(t, y)` on top of `peroxide`'s Runge-Kutta
//! integrators: Dormand-Prince 5(4) in adaptive mode, classical RK5 with a
//! fixed step otherwise.
//!
//! `peroxide` advances one step at a time; [`OdeStepper`] drives it so
//! that every call lands exactly on the requested time and carries the
//! step size over to the next call.

use log::trace;
use ndarray::Array1;
use peroxide::fuga::{ODEIntegrator, ODEProblem, DP45, RK5};
use serde::{Deserialize, Serialize};
use std::cell::Cell;

use crate::error::{FitError, Result};

/// How an [`OdeStepper`] chooses its steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdeStepperOptions {
    /// Adapt the step to the error estimate. Default: true
    pub adaptive: bool,

    /// Initial step; in fixed mode, the step itself (0 means one step per
    /// call). Default: 0.01
    pub h_start: f64,

    /// Default: 1e-6
    pub eps_abs: f64,

    /// Default: 1e-6
    pub eps_rel: f64,

    /// Smallest step the integrator may propose. Default: 1e-12
    pub h_min: f64,

    /// Largest step, unbounded when `None`. Default: None
    pub h_max: Option<f64>,

    /// Rejected attempts allowed within a single step. Default: 50
    pub max_rejections: usize,

    /// Maximum number of accepted steps per call to
    /// [`apply`](OdeStepper::apply). Default: 100000
    pub max_steps: usize,
}

impl Default for OdeStepperOptions {
    fn default() -> Self {
        Self {
            adaptive: true,
            h_start: 0.01,
            eps_abs: 1e-6,
            eps_rel: 1e-6,
            h_min: 1e-12,
            h_max: None,
            max_rejections: 50,
            max_steps: 100_000,
        }
    }
}

impl OdeStepperOptions {
    /// Fixed-step integration with step `h`.
    pub fn fixed(h: f64) -> Self {
        Self {
            adaptive: false,
            h_start: h,
            ..Default::default()
        }
    }

    pub fn with_tolerances(mut self, eps_abs: f64, eps_rel: f64) -> Self {
        self.eps_abs = eps_abs;
        self.eps_rel = eps_rel;
        self
    }

    pub fn with_step_bounds(mut self, h_min: f64, h_max: Option<f64>) -> Self {
        self.h_min = h_min;
        self.h_max = h_max;
        self
    }

    pub fn description(&self) -> String {
        if self.adaptive {
            format!(
                "adaptive, initial step size {}, absolute precision {}, relative precision {}",
                self.h_start, self.eps_abs, self.eps_rel
            )
        } else {
            format!("fixed, step size {}", self.h_start)
        }
    }

    /// Dormand-Prince integrator whose absolute tolerance covers both
    /// precisions for a state of magnitude `scale`.
    fn dormand_prince(&self, scale: f64) -> DP45 {
        DP45::new(
            self.eps_abs + self.eps_rel * scale,
            0.9,
            self.h_min,
            self.h_max.unwrap_or(f64::MAX),
            self.max_rejections.max(1),
        )
    }
}

/// Wraps a problem and remembers the latest time it was evaluated at.
///
/// The last stage of both tableaux sits at the end of the step, so after
/// an accepted step this is the time actually reached.
struct Tracked<'p, P> {
    inner: &'p P,
    last_time: Cell<f64>,
}

impl<P: ODEProblem> ODEProblem for Tracked<'_, P> {
    fn rhs(&self, t: f64, y: &[f64], dy: &mut [f64]) -> anyhow::Result<()> {
        self.last_time.set(t);
        self.inner.rhs(t, y, dy)
    }
}

/// Integrator state carried between calls: the options and the step size
/// learned so far.
#[derive(Debug, Clone)]
pub struct OdeStepper {
    options: OdeStepperOptions,
    h: f64,
}

impl OdeStepper {
    pub fn new(options: OdeStepperOptions) -> Self {
        Self {
            h: options.h_start,
            options,
        }
    }

    pub fn options(&self) -> &OdeStepperOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: OdeStepperOptions) {
        self.options = options;
        self.reset();
    }

    /// Forgets the step size learned so far.
    pub fn reset(&mut self) {
        self.h = self.options.h_start;
    }

    /// Advances `y` from `*t` to `t1`, updating `*t`.
    ///
    /// Errors returned by `problem` as a [`FitError`] come back unchanged.
    ///
    /// # Errors
    ///
    /// * `FitError::Integration` when the step size underflows, the step
    ///   budget runs out or the solution stops being finite
    /// * `FitError::InvalidInput` when `t1 < *t`
    pub fn apply<P: ODEProblem>(
        &mut self,
        problem: &P,
        t: &mut f64,
        t1: f64,
        y: &mut Array1<f64>,
    ) -> Result<()> {
        if t1 < *t {
            return Err(FitError::InvalidInput(format!(
                "cannot integrate backwards from {} to {}",
                t, t1
            )));
        }
        if t1 == *t {
            return Ok(());
        }
        let from = *t;
        let fail = |message: String| FitError::Integration {
            from,
            to: t1,
            message,
        };
        let lift = |err: anyhow::Error| match err.downcast::<FitError>() {
            Ok(e) => e,
            Err(other) => fail(other.to_string()),
        };
        let state = y
            .as_slice_mut()
            .ok_or_else(|| FitError::Logic("state vector is not contiguous".to_string()))?;

        if !self.options.adaptive {
            let nb = if self.options.h_start > 0.0 {
                ((t1 - *t) / self.options.h_start).ceil().max(1.0) as usize
            } else {
                1
            };
            let h = (t1 - *t) / nb as f64;
            let integrator = RK5::default();
            for i in 0..nb {
                integrator.step(problem, *t, state, h).map_err(lift)?;
                *t = if i + 1 == nb { t1 } else { *t + h };
            }
            if state.iter().any(|v| !v.is_finite()) {
                return Err(fail("solution is not finite".to_string()));
            }
            return Ok(());
        }

        if self.h.is_nan() || self.h <= 0.0 {
            self.h = (t1 - *t).abs() * 1e-3;
        }
        let tracked = Tracked {
            inner: problem,
            last_time: Cell::new(*t),
        };
        let mut steps = 0;
        while *t < t1 {
            let proposed = self.options.h_max.map_or(self.h, |m| self.h.min(m));
            let last = proposed >= t1 - *t;
            let h = if last { t1 - *t } else { proposed };
            if !last && h <= f64::EPSILON * t.abs().max(1.0) {
                return Err(fail(format!("step size underflow at t = {}", t)));
            }

            let scale = state.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            let integrator = self.options.dormand_prince(scale);
            let next_h = integrator.step(&tracked, *t, state, h).map_err(lift)?;
            if state.iter().any(|v| !v.is_finite()) {
                return Err(fail(format!("solution is not finite after t = {}", t)));
            }

            let reached = tracked.last_time.get();
            if reached - *t < h * (1.0 - 1e-12) {
                trace!("step {:e} at t = {} shrunk to {:e}", h, t, reached - *t);
            }
            let new_t = if last && reached >= t1 - 1e-12 * h { t1 } else { reached };
            if new_t <= *t {
                return Err(fail(format!("step size underflow at t = {}", t)));
            }
            *t = new_t;

            steps += 1;
            if steps > self.options.max_steps {
                return Err(fail(format!(
                    "more than {} steps needed",
                    self.options.max_steps
                )));
            }
            // Do not let the shortened final step shrink the next one
            if !last || next_h > self.h {
                self.h = next_h;
            }
        }
        Ok(())
    }
}
