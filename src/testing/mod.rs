//! Testing utilities and mock implementations
//!
//! Shared by the unit tests and the integration tests under `tests/`.

pub mod mocks;

pub use mocks::*;
