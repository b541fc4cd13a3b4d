//! Executor error types.

use crate::gateway::GatewayError;
use sentinel_core::FaultKind;
use sentinel_resilience::{CallError, CircuitOpenError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gateway error: {0}")]
    Gateway(GatewayError),

    #[error("Nonce rejected after resync: {0}")]
    NonceRejected(String),
}

impl ExecutorError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::CircuitOpen(_) => FaultKind::CircuitOpen,
            Self::Timeout(_) => FaultKind::Retryable,
            Self::Gateway(e) => e.kind(),
            Self::NonceRejected(_) => FaultKind::Authentication,
        }
    }

    /// The order may have reached the exchange: the call timed out or the
    /// transport failed after retries. Only a definite refusal (breaker
    /// open, rejection, rate limit, authentication) proves nothing rests.
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Gateway(GatewayError::Transient(_))
        )
    }
}

impl From<CallError<GatewayError>> for ExecutorError {
    fn from(err: CallError<GatewayError>) -> Self {
        match err {
            CallError::CircuitOpen(e) => Self::CircuitOpen(e),
            CallError::Timeout(d) => Self::Timeout(d),
            CallError::Operation(e) => Self::Gateway(e),
        }
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
