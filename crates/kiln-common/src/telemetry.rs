//! Logging initialization
//!
//! Both binaries log through `tracing`. Output is JSON by default so that log
//! aggregation can index structured fields (object names, job names, reasons);
//! plain text is available for local development. Filtering follows
//! `RUST_LOG`, falling back to `info`.

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Unknown log format name
    #[error("unknown log format '{0}', expected 'json' or 'text'")]
    UnknownFormat(String),

    /// Failed to install the global subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable text
    Text,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "plain" => Ok(Self::Text),
            other => Err(TelemetryError::UnknownFormat(other.to_string())),
        }
    }
}

/// Install the global tracing subscriber
pub fn init_logging(format: LogFormat) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
    };
    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}
