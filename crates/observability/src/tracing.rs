//! Tracing/logging initialization.
//!
//! `RUST_LOG` always wins over the configured default filter.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObservabilityConfig {
    /// JSON lines when true, human-readable output otherwise.
    #[serde(default = "default_json")]
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_json() -> bool {
    true
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            json: default_json(),
            filter: default_filter(),
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(&ObservabilityConfig::default());
}

pub fn init_with(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    // try_init: a subscriber installed earlier (tests, embedding app) is kept.
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.pretty().try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init_with(&ObservabilityConfig {
            json: false,
            filter: "debug".to_string(),
        });
    }

    #[test]
    fn defaults_are_json_at_info() {
        let config = ObservabilityConfig::default();
        assert!(config.json);
        assert_eq!(config.filter, "info");
    }
}
