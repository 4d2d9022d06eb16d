//! Cross-module tests
//!
//! Unit tests live next to their modules; these exercise the executor,
//! the interception adapter and the facade together.

pub mod executor_tests;
