//! Tests of the sparse bookkeeping shared by jacobians and covariances.

pub mod jacobian_tests;
