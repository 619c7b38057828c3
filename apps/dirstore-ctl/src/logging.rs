//! Structured logging setup using tracing.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ConfigError, LogFormat};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` in the environment takes precedence over `filter`.
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` when the filter directive does not parse.
pub fn init_logging(filter: &str, format: LogFormat) -> Result<(), ConfigError> {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| ConfigError::InvalidValue {
            var: "RUST_LOG".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter_layer);
    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .flatten_event(true),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init(),
    }

    tracing::debug!(filter = %filter, "Logging initialized");
    Ok(())
}
