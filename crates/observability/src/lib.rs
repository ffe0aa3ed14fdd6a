//! Tracing and logging setup shared by duraq binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{init, init_with, LogFormat};
