//! The `utils` module provides shared definitions used across the `fanbus`
//! crate.
//!
//! It centralizes the crate error type and the tracing subscriber setup so
//! that the broker adapters, the channel and the binary report failures the
//! same way.

pub mod error;
pub mod logging;

pub use error::{BusError, Result};
