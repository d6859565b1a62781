//! Numerical helpers shared by the fitting and kinetics modules.

pub mod finite_difference;
pub mod matrix_convert;
