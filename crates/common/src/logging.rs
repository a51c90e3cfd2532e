//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`. Fails if a global
/// subscriber is already installed.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = build_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Logging(e.to_string()))
}

/// Install a test-writer subscriber, ignoring an already-installed one
///
/// Safe to call from every test; output is captured by the test harness.
pub fn try_setup_test_logging(default_level: &str) {
    if let Ok(filter) = build_filter(default_level) {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    }
}
