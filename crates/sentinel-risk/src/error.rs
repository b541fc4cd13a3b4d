//! Risk error types.

use sentinel_core::{FaultKind, ReservationId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Unknown reservation: {0}")]
    UnknownReservation(ReservationId),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl RiskError {
    pub fn kind(&self) -> FaultKind {
        FaultKind::RiskViolation
    }
}

pub type RiskResult<T> = Result<T, RiskError>;
