//! Tests of the almost-block-diagonal matrix against dense linear algebra.

pub mod abd_tests;
