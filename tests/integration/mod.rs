//! Integration tests that use the library as a whole.

// Global/local fits over several datasets
pub mod multi_dataset;

// Kinetic evaluators, alone and as fit models
pub mod kinetics;
