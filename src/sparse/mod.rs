//! Sparse bookkeeping of multi-dataset fits.
//!
//! Local parameters of distinct datasets never share residuals, so the
//! Jacobian of a fit over N datasets is mostly zeros. [`SparseJacobian`]
//! stores one column per local definition instead of one per dataset, and
//! [`SparseCovariance`] reads back the covariance through the same
//! [`ParameterIndexMap`].

pub mod covariance;
pub mod index_map;
pub mod jacobian;

pub use covariance::{correlation_matrix, standard_errors, SparseCovariance};
pub use index_map::ParameterIndexMap;
pub use jacobian::SparseJacobian;
