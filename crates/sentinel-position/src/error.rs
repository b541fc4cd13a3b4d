//! Position error types.

use sentinel_core::{FaultKind, PositionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Position not found: {0}")]
    NotFound(PositionId),

    #[error("Position {0} already has a closing order in flight")]
    AlreadyClosing(PositionId),

    #[error("Invalid fill: {0}")]
    InvalidFill(String),
}

impl PositionError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::NotFound(_) | Self::AlreadyClosing(_) => FaultKind::Retryable,
            Self::InvalidFill(_) => FaultKind::RiskViolation,
        }
    }
}

pub type PositionResult<T> = Result<T, PositionError>;
