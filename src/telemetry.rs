//! Logging configuration for Caravan.
//!
//! # Basic Logging
//!
//! ```rust,no_run
//! use caravan::telemetry::{LogFormat, init_logging};
//!
//! // Initialize pretty logging (default)
//! init_logging(LogFormat::Pretty).expect("Failed to init logging");
//!
//! // Or JSON logging for production
//! init_logging(LogFormat::Json).expect("Failed to init logging");
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: Set to `json` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: Control log levels (default: `info`)

use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty-print format (default).
    #[default]
    Pretty,
    /// JSON format for log aggregators (Elasticsearch, Loki, etc.).
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        })
    }
}

impl LogFormat {
    /// Read from LOG_FORMAT environment variable.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Initialize logging with the specified format.
///
/// This sets up the tracing subscriber with either JSON or pretty-print
/// output. Log levels are controlled via the `RUST_LOG` environment
/// variable.
///
/// Note: JSON logging requires the `json` feature on tracing-subscriber.
/// Without it, JSON format falls back to pretty format with a warning.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            // JSON logging - uses pretty format as fallback
            // To enable true JSON, add `features = ["json"]` to tracing-subscriber in Cargo.toml
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
            tracing::warn!(
                "JSON logging requested but json feature not enabled, using pretty format"
            );
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("anything".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    }

    #[test]
    fn test_log_format_default() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
