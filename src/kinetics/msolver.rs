//! Multidimensional root finding by damped Newton iterations.

use log::{debug, trace};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::utils::finite_difference::{forward_jacobian, DEFAULT_RELATIVE_STEP};
use crate::utils::matrix_convert::{nalgebra_vec_to_ndarray, ndarray_to_nalgebra, ndarray_vec_to_nalgebra};

/// Stopping rules of [`MSolver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootSolverOptions {
    /// Default: 0
    pub absolute_precision: f64,

    /// Default: 1e-5
    pub relative_precision: f64,

    /// Default: 40
    pub max_iterations: usize,

    /// Maximum number of step halvings per iteration. Default: 10
    pub max_damping: usize,
}

impl Default for RootSolverOptions {
    fn default() -> Self {
        Self {
            absolute_precision: 0.0,
            relative_precision: 1e-5,
            max_iterations: 40,
            max_damping: 10,
        }
    }
}

/// Newton solver for `f(x) = 0` with `f: Rⁿ → Rⁿ`.
///
/// The Jacobian is computed by forward differences. A step is halved until
/// it decreases `|f|`; iterations stop once every component of the step
/// satisfies `|dx| < absolute_precision + relative_precision · |x|`.
#[derive(Debug, Clone, Default)]
pub struct MSolver {
    options: RootSolverOptions,
}

impl MSolver {
    pub fn new(options: RootSolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RootSolverOptions {
        &self.options
    }

    fn converged(&self, dx: &Array1<f64>, x: &Array1<f64>) -> bool {
        dx.iter().zip(x.iter()).all(|(d, v)| {
            *d == 0.0
                || d.abs() < self.options.absolute_precision + self.options.relative_precision * v.abs()
        })
    }

    /// Finds a root of `f` starting from `initial`.
    ///
    /// # Errors
    ///
    /// * `FitError::RootFinding` when the Jacobian is singular or the
    ///   iteration budget runs out
    /// * errors returned by `f`
    pub fn solve<F>(&self, mut f: F, initial: ArrayView1<'_, f64>) -> Result<Array1<f64>>
    where
        F: FnMut(ArrayView1<'_, f64>) -> Result<Array1<f64>>,
    {
        let mut x = initial.to_owned();
        let mut fx = f(x.view())?;
        if fx.len() != x.len() {
            return Err(FitError::DimensionMismatch(format!(
                "function has {} components for {} unknowns",
                fx.len(),
                x.len()
            )));
        }

        for iteration in 0..self.options.max_iterations {
            let jac = forward_jacobian(&mut f, x.view(), fx.view(), DEFAULT_RELATIVE_STEP)?;
            let rhs = ndarray_vec_to_nalgebra((-&fx).view());
            let step = ndarray_to_nalgebra(jac.view())
                .lu()
                .solve(&rhs)
                .ok_or_else(|| FitError::RootFinding {
                    iterations: iteration,
                    message: "singular jacobian".to_string(),
                })?;
            let mut dx = nalgebra_vec_to_ndarray(&step);

            let norm = fx.dot(&fx);
            let mut damping = 0;
            let (x_new, f_new) = loop {
                let candidate = &x + &dx;
                let fc = f(candidate.view())?;
                let nc = fc.dot(&fc);
                if (nc.is_finite() && nc <= norm) || damping >= self.options.max_damping {
                    break (candidate, fc);
                }
                dx *= 0.5;
                damping += 1;
            };
            trace!(
                "newton iteration {}: |f|² = {:e}, {} halvings",
                iteration,
                f_new.dot(&f_new),
                damping
            );

            x = x_new;
            fx = f_new;
            if self.converged(&dx, &x) {
                debug!("root found after {} iterations", iteration + 1);
                return Ok(x);
            }
        }
        Err(FitError::RootFinding {
            iterations: self.options.max_iterations,
            message: "maximum number of iterations reached".to_string(),
        })
    }
}
