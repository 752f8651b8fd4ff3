//! Tracing setup for the `matisse` binary.
//!
//! The log level comes from the loaded [`Settings`]; `RUST_LOG` overrides it
//! when set.

use clap::ValueEnum;
use matisse_core::Settings;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Multi-line, colored (interactive use)
    Pretty,
    /// Single-line, no colors
    Compact,
    /// One JSON object per line (log aggregation)
    Json,
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
}

impl LoggingConfig {
    /// Logging options from the controller settings.
    pub fn from_settings(settings: &Settings, format: OutputFormat) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&settings.log_level)?,
            format,
            with_file_and_line: false,
        })
    }
}

/// Install the global subscriber.
///
/// Idempotent: a subscriber installed earlier is left in place.
pub fn init(config: &LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let fmt_layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_target(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
