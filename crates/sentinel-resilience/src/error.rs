//! Breaker error types.

use sentinel_core::FaultKind;
use std::time::Duration;
use thiserror::Error;

/// The guarded operation was not invoked because the breaker is open
/// (or its single half-open trial is already in flight).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit '{breaker}' is open, retry in {retry_in:?}")]
pub struct CircuitOpenError {
    pub breaker: String,
    pub retry_in: Duration,
}

impl CircuitOpenError {
    pub fn kind(&self) -> FaultKind {
        FaultKind::CircuitOpen
    }
}

/// Outcome of [`CircuitBreaker::call`](crate::CircuitBreaker::call).
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Operation(E),
}

impl<E> CallError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// The operation's own error, if it ran and failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Map the operation error, keeping breaker outcomes.
    pub fn map_operation<F, U>(self, f: F) -> CallError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Self::CircuitOpen(e) => CallError::CircuitOpen(e),
            Self::Timeout(d) => CallError::Timeout(d),
            Self::Operation(e) => CallError::Operation(f(e)),
        }
    }
}
