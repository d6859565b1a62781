//! Kinetic models used as fit functions.
//!
//! * [`LinearKineticSystem`]: first-order networks solved in closed form.
//! * [`KineticSystem`]: reaction networks parsed from text, evaluated by
//!   [`KineticSystemEvolver`] (time integration) or
//!   [`KineticSystemSteadyState`] (steady states along a potential sweep).
//!
//! [`OdeStepper`] and [`MSolver`] are the numerical engines underneath and
//! can be used on their own.

pub mod evolver;
pub mod linear;
pub mod msolver;
pub mod ode;
pub mod steady_state;
pub mod system;

pub use evolver::{KineticSystemEvolver, ParameterCallback};
pub use linear::LinearKineticSystem;
pub use msolver::{MSolver, RootSolverOptions};
pub use ode::{OdeStepper, OdeStepperOptions};
pub use steady_state::{KineticSystemSteadyState, Voltammogram};
pub use system::{KineticSystem, Reaction, Species, ALPHA, FARADAY, GAS_CONSTANT};
