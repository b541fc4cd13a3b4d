//! Closed failure taxonomy.
//!
//! Every error surfaced by a sentinel crate maps onto exactly one
//! `FaultKind`. Log events for failures carry the tag as a `kind`
//! field so that alerting can route on it without string matching
//! on messages.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Transient network/IO failure. Retried locally, never surfaced to the engine.
    Retryable,
    /// Stale or duplicate nonce, invalid credentials.
    Authentication,
    /// Signal rejected by the risk gate. Logged, signal dropped.
    RiskViolation,
    /// Guarded operation short-circuited by an open breaker.
    CircuitOpen,
    /// Session cannot be re-established without outside help.
    ConnectionFatal,
    /// Kill-switch condition. Only path to an autonomous stop.
    Emergency,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Authentication => "authentication",
            Self::RiskViolation => "risk_violation",
            Self::CircuitOpen => "circuit_open",
            Self::ConnectionFatal => "connection_fatal",
            Self::Emergency => "emergency",
        }
    }

    /// Whether the operation that produced this fault may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable | Self::CircuitOpen)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kind_tags() {
        assert_eq!(FaultKind::RiskViolation.to_string(), "risk_violation");
        assert_eq!(
            serde_json::to_string(&FaultKind::ConnectionFatal).unwrap(),
            "\"connection_fatal\""
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FaultKind::Retryable.is_retryable());
        assert!(FaultKind::CircuitOpen.is_retryable());
        assert!(!FaultKind::Emergency.is_retryable());
        assert!(!FaultKind::RiskViolation.is_retryable());
    }
}
