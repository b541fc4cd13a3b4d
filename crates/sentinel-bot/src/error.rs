//! Application error types.

use crate::engine::EngineState;
use sentinel_core::FaultKind;
use thiserror::Error;

/// Lifecycle errors returned by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: EngineState,
    },

    #[error("Emergency latch is set ({0}); an operator must clear it first")]
    EmergencyLatched(String),
}

impl EngineError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::InvalidState { .. } => FaultKind::Retryable,
            Self::EmergencyLatched(_) => FaultKind::Emergency,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] sentinel_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Engine(e) => e.kind(),
            Self::Config(_) | Self::Telemetry(_) | Self::Io(_) => FaultKind::ConnectionFatal,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
