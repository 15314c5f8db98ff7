//! Tracing/logging setup shared by worker processes.

/// Initialize process-wide tracing with defaults (JSON, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_from(&tracing::LogConfig::default());
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::{LogConfig, LogFormat, init_from};
