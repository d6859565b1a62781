//! # Parameter System
//!
//! Describes what is fitted in a multi-dataset fit:
//!
//! - [`ParameterDefinition`]: a named kind of parameter, global or local
//! - [`FreeParameter`]: one scalar actually varied by the optimizer
//! - [`FitLayout`]: definitions unrolled over the datasets, with fixed
//!   parameters skipped
//! - [`Expression`]: formulas used by the kinetic models for rate constants
//!
//! ## Example Usage
//!
//! ```rust
//! use multifit_rs::parameters::FitLayout;
//!
//! // E0 is shared, k has one value per dataset, and is fixed in dataset 1
//! let layout = FitLayout::builder(3)
//!     .global("E0")
//!     .local("k")
//!     .fix("k", Some(1))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(layout.free_count(), 3);
//! assert_eq!(layout.fit_index(0, 2), Some(0));
//! assert_eq!(layout.fit_index(1, 1), None);
//! ```

pub mod definition;
pub mod expression;
pub mod layout;

pub use definition::{FreeParameter, ParameterDefinition};
pub use expression::{EvaluationContext, Expression, ExpressionError, SimpleContext, SlotValues};
pub use layout::{FitLayout, FitLayoutBuilder};
