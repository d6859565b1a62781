//! # multifit-rs
//!
//! `multifit-rs` fits one model to several datasets at once. Each parameter
//! of the model is either global (one value shared by every dataset),
//! local (one value per dataset) or fixed.
//!
//! The library provides:
//! - [`FitLayout`] / [`ParameterIndexMap`]: the mapping between model
//!   parameters, datasets and the packed vector of free parameters
//! - [`SparseJacobian`]: a Jacobian storing one column per local parameter
//!   instead of one per dataset
//! - [`ABDMatrix`]: almost-block-diagonal normal equations, solved by a
//!   Schur complement in time linear in the number of datasets
//! - [`MultiFitEngine`]: a Levenberg-Marquardt engine working on either
//!   representation, with covariance estimates ([`SparseCovariance`])
//! - [`kinetics`]: kinetic models (closed-form linear systems, reaction
//!   networks integrated in time, electrochemical steady states)
//!
//! ## Basic Usage
//!
//! ```
//! use multifit_rs::{model_fn, Dataset, FitData, FitLayout, MultiFitConfig, MultiFitEngine};
//! use ndarray::{Array1, ArrayView1, ArrayViewMut1};
//!
//! // y = a x + b, with a shared slope and one offset per dataset
//! let model = model_fn(|p: &[f64], x: ArrayView1<'_, f64>, mut y: ArrayViewMut1<'_, f64>| {
//!     y.assign(&x.mapv(|x| p[0] * x + p[1]));
//!     Ok(())
//! });
//! let x = Array1::linspace(0.0, 1.0, 5);
//! let datasets = vec![
//!     Dataset::new("first", x.clone(), x.mapv(|x| 2.0 * x + 1.0)).unwrap(),
//!     Dataset::new("second", x.clone(), x.mapv(|x| 2.0 * x - 1.0)).unwrap(),
//! ];
//! let layout = FitLayout::builder(2).global("a").local("b").build().unwrap();
//!
//! let mut data = FitData::new(model, datasets, layout).unwrap();
//! data.set_value("a", None, 1.0).unwrap();
//! let report = MultiFitEngine::new(&data, MultiFitConfig::default())
//!     .unwrap()
//!     .run()
//!     .unwrap();
//! assert!(report.success());
//! assert!((report.values[0] - 2.0).abs() < 1e-6);
//! ```

pub mod abd;
pub mod error;
pub mod fitdata;
pub mod kinetics;
pub mod lm;
pub mod parameters;
pub mod problem;
pub mod sparse;

mod utils;

// Re-exports for convenience
pub use abd::ABDMatrix;
pub use error::{FitError, Result};
pub use fitdata::FitData;
pub use lm::{FitReport, IterationStatus, MultiFitConfig, MultiFitEngine, StopFlag};
pub use parameters::{FitLayout, ParameterDefinition};
pub use problem::{model_fn, Dataset, FnModel, MultiFitModel};
pub use sparse::{ParameterIndexMap, SparseCovariance, SparseJacobian};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
