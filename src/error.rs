use thiserror::Error;

use crate::parameters::expression::ExpressionError;

/// Error types for the multifit-rs library.
///
/// Variants fall in three families: construction errors (bad sizes, mismatched
/// counts), numerical failures (singular blocks, stalled integrators or root
/// finders) and logic errors (index-mapping bugs in the caller).
#[derive(Error, Debug)]
pub enum FitError {
    /// Error indicating a mismatch in matrix or vector dimensions.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Invalid input data, detected at construction time.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A block of a matrix could not be factored.
    #[error("Singular matrix in block {block}: {message}")]
    SingularMatrix { block: usize, message: String },

    /// The ODE stepper could not reach the requested time.
    #[error("Integration failed between t = {from} and t = {to}: {message}")]
    Integration { from: f64, to: f64, message: String },

    /// The multidimensional root finder did not converge.
    #[error("Root finding failed after {iterations} iterations: {message}")]
    RootFinding { iterations: usize, message: String },

    /// Error indicating the fit failed to make progress.
    #[error("Algorithm failed to converge: {0}")]
    ConvergenceFailure(String),

    /// Error during model evaluation.
    #[error("Function evaluation error: {0}")]
    FunctionEvaluation(String),

    /// Misuse of an index map or sparse structure.
    #[error("Logic error: {0}")]
    Logic(String),

    /// Parameter not found.
    #[error("Parameter not found: {0}")]
    ParameterNotFound(String),

    /// Error while parsing or evaluating a formula.
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Generic error for cases that don't fit the other categories.
    #[error("Error: {0}")]
    Other(String),
}

impl FitError {
    /// Shorthand for a singular-block failure.
    pub fn singular(block: usize, message: impl Into<String>) -> Self {
        FitError::SingularMatrix {
            block,
            message: message.into(),
        }
    }

    /// Returns true for failures caused by the numbers rather than by the caller.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            FitError::SingularMatrix { .. }
                | FitError::Integration { .. }
                | FitError::RootFinding { .. }
                | FitError::ConvergenceFailure(_)
        )
    }

    /// Returns true for index-mapping and state errors.
    pub fn is_logic(&self) -> bool {
        matches!(self, FitError::Logic(_) | FitError::ParameterNotFound(_))
    }
}

/// Result type alias for multifit-rs operations.
pub type Result<T> = std::result::Result<T, FitError>;

impl From<String> for FitError {
    fn from(s: String) -> Self {
        FitError::Other(s)
    }
}

impl From<&str> for FitError {
    fn from(s: &str) -> Self {
        FitError::Other(s.to_string())
    }
}
