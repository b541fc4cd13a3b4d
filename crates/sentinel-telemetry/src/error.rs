//! Telemetry error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// A global subscriber was already installed.
    #[error("Logging already initialized: {0}")]
    SubscriberInstalled(String),

    #[error("Metrics encoding failed: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("Metrics text is not UTF-8: {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    #[error("Failed to write metrics to {}: {source}", path.display())]
    Dump {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
