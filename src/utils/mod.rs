//! The `utils` module provides the error types and logging setup shared
//! across the broker.

pub mod error;
pub mod logging;
