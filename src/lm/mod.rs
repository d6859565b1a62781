//! Levenberg-Marquardt fitting of several datasets at once.
//!
//! [`MultiFitEngine`] solves the damped normal equations either densely or,
//! in sparse mode, as an [`ABDMatrix`](crate::abd::ABDMatrix) whose blocks
//! follow the global/local structure of the parameters. Both modes take the
//! same steps; sparse mode just never builds the full `JᵗJ`.

pub mod algorithm;
pub mod config;
pub mod convergence;
mod normal;

pub use algorithm::{FitReport, IterationDiagnostics, MultiFitEngine};
pub use config::MultiFitConfig;
pub use convergence::{max_relative_change, IterationStatus, StopFlag};
