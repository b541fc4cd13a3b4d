//! WebSocket error types.

use crate::connection::ConnectionState;
use sentinel_core::FaultKind;
use sentinel_resilience::{CallError, CircuitOpenError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Connect handshake exceeded {0:?}")]
    ConnectTimeout(Duration),

    #[error("No traffic for {0:?}")]
    WatchdogTimeout(Duration),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Subscription to {channel} rejected: {reason}")]
    SubscriptionRejected { channel: String, reason: String },

    #[error("Illegal state transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Max reconnection attempts reached ({0})")]
    AttemptsExhausted(u32),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WsError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::ConnectionFailed(_)
            | Self::ConnectionClosed { .. }
            | Self::ConnectTimeout(_)
            | Self::WatchdogTimeout(_)
            | Self::Tungstenite(_)
            | Self::Json(_) => FaultKind::Retryable,
            Self::Authentication(_) => FaultKind::Authentication,
            Self::CircuitOpen(_) => FaultKind::CircuitOpen,
            Self::SubscriptionRejected { .. }
            | Self::InvalidTransition { .. }
            | Self::AttemptsExhausted(_) => FaultKind::ConnectionFatal,
        }
    }
}

impl From<CallError<WsError>> for WsError {
    fn from(err: CallError<WsError>) -> Self {
        match err {
            CallError::CircuitOpen(open) => Self::CircuitOpen(open),
            CallError::Timeout(limit) => Self::ConnectTimeout(limit),
            CallError::Operation(e) => e,
        }
    }
}

pub type WsResult<T> = Result<T, WsError>;
