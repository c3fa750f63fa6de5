//! Tracing subscriber setup for the bring-up binary and host applications.
//!
//! The configured level is used only when `RUST_LOG` is unset.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::traits::{DriverError, Result};

/// Install a global fmt subscriber.
///
/// Calling it again after a subscriber is installed is not an error.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = parse_level(&config.level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer().pretty().with_target(false).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_ansi(false).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("already been set") => Ok(()),
        Err(err) => Err(DriverError::Config(format!(
            "failed to initialize logging: {err}"
        ))),
    }
}

fn parse_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(DriverError::Config(format!(
            "invalid log level '{level}', expected trace, debug, info, warn or error"
        ))),
    }
}
