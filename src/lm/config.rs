//! Configuration of the multi-dataset Levenberg-Marquardt engine.

use serde::{Deserialize, Serialize};

/// Configuration options for [`MultiFitEngine`](super::MultiFitEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiFitConfig {
    /// Initial value of the damping parameter. Default: 1e-2
    pub lambda: f64,

    /// Factor by which lambda is changed after each trial. Default: 2
    pub scale: f64,

    /// Largest relative parameter change still considered converged. Default: 1e-5
    pub end_threshold: f64,

    /// Added to `|p|` in relative changes, so that parameters close to zero
    /// do not prevent convergence. Default: 1e-3
    pub relative_min: f64,

    /// Maximum number of iterations. Default: 50
    pub max_iterations: usize,

    /// Maximum number of increases of lambda within one iteration. Default: 30
    pub max_step_tries: usize,

    /// Solve the normal equations as an almost-block-diagonal matrix.
    /// Default: true
    pub sparse: bool,

    /// Singular values below this fraction of the largest one are dropped
    /// from the dense covariance. Default: 1e-7
    pub svd_tolerance: f64,
}

impl Default for MultiFitConfig {
    fn default() -> Self {
        Self {
            lambda: 1e-2,
            scale: 2.0,
            end_threshold: 1e-5,
            relative_min: 1e-3,
            max_iterations: 50,
            max_step_tries: 30,
            sparse: true,
            svd_tolerance: 1e-7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MultiFitConfig::default();
        assert_eq!(config.lambda, 1e-2);
        assert_eq!(config.scale, 2.0);
        assert_eq!(config.max_step_tries, 30);
        assert!(config.sparse);
    }

    #[test]
    fn test_json_round_trip() {
        let config = MultiFitConfig {
            sparse: false,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: MultiFitConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
