//! The `utils` module provides shared definitions used across `mqttlink`:
//! the crate's error types and the tracing subscriber setup.

pub mod error;
pub mod logging;
