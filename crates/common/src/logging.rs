//! Logging setup and configuration
//!
//! Log output goes to stderr so the operator console on stdout stays clean.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` overrides `default_level` when set.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| parse_filter(default_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Build a filter from a level or directive string
pub fn parse_filter(directives: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}
