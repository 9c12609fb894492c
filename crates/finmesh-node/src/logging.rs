//! Logging setup.
//!
//! One call at process start wires up `tracing` for every crate in the
//! workspace. The `RUST_LOG` environment variable overrides the configured
//! default filter.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Errors that can occur during logging initialization.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The global subscriber was already set.
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    /// The env filter directive did not parse.
    #[error("failed to parse env filter: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::ParseError),
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single-line format (default).
    #[default]
    Text,
    /// JSON format for structured collection.
    Json,
}

/// Configuration for logging initialization.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set.
    pub default_level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Whether to include the module path on each line.
    pub include_target: bool,
    /// Custom filter directive; overrides `default_level` when set.
    pub env_filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            format: LogFormat::Text,
            include_target: true,
            env_filter: None,
        }
    }
}

impl LoggingConfig {
    /// Builder: set the default level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Builder: set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Builder: set a custom filter directive.
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }
}

/// Initializes the global tracing subscriber. Call once at startup.
pub fn init_logging(config: LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = if let Some(ref filter) = config.env_filter {
        EnvFilter::try_new(filter)?
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("finmesh={}", config.default_level)))
    };

    match config.format {
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_target(config.include_target));
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_target(config.include_target));
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.default_level, Level::INFO);
        assert_eq!(config.format, LogFormat::Text);
        assert!(config.include_target);
        assert!(config.env_filter.is_none());
    }

    #[test]
    fn builders() {
        let config = LoggingConfig::default()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_env_filter("finmesh=trace");

        assert_eq!(config.default_level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.env_filter.as_deref(), Some("finmesh=trace"));
    }
}
