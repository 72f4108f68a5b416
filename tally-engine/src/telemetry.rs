//! Tracing subscriber initialization.

use crate::constants::{DEFAULT_LOG_FILTER, DEFAULT_SERVICE_NAME};
use std::fmt;
use std::str::FromStr;
use tally_core::{ConfigError, TallyResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(ConfigError::InvalidValue {
                field: "log_format".to_string(),
                value: other.to_string(),
                reason: "expected \"json\" or \"pretty\"".to_string(),
            }),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name recorded in the startup event
    pub service_name: String,
    pub log_format: LogFormat,
    /// `EnvFilter` directives
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            log_format: LogFormat::default(),
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Environment variables:
    /// - `TALLY_SERVICE_NAME` (default: "tally")
    /// - `TALLY_LOG_FORMAT`: "json" or "pretty" (default: json)
    /// - `TALLY_LOG_FILTER`, then `RUST_LOG` (default: [`DEFAULT_LOG_FILTER`])
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("TALLY_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_format: std::env::var("TALLY_LOG_FORMAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.log_format),
            filter: std::env::var("TALLY_LOG_FILTER")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or(defaults.filter),
        }
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. An invalid filter falls back to
/// [`DEFAULT_LOG_FILTER`]; a second call fails with `ConfigError`.
pub fn init_tracing(config: &TelemetryConfig) -> TallyResult<()> {
    let env_filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|e| {
        eprintln!("invalid log filter {:?} ({}), using default", config.filter, e);
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ConfigError::InvalidValue {
            field: "tracing".to_string(),
            value: config.log_format.to_string(),
            reason: format!("failed to init subscriber: {}", e),
        })?;

    tracing::info!(
        service_name = %config.service_name,
        log_format = %config.log_format,
        filter = %config.filter,
        "Telemetry initialized"
    );
    Ok(())
}
