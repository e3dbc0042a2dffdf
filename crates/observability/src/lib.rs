//! Tracing and logging setup shared by the ledger binaries and tests.

pub use crate::tracing::ObservabilityConfig;

/// Initialize process-wide observability with defaults (JSON, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize process-wide observability from explicit settings.
pub fn init_with(config: &ObservabilityConfig) {
    tracing::init_with(config);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
