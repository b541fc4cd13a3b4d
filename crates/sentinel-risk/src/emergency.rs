//! Kill-switch latch.
//!
//! Once triggered, remains triggered until an operator clears it. While
//! triggered the engine refuses to start.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sentinel_telemetry::Metrics;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// Reason for an emergency trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmergencyReason {
    /// Breakers failed to recover across consecutive health checks.
    BreakersStuckOpen { breakers: Vec<String>, checks: u32 },
    /// Manual trigger by operator.
    Manual { message: String },
}

impl std::fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BreakersStuckOpen { breakers, checks } => write!(
                f,
                "breakers [{}] open for {} consecutive health checks",
                breakers.join(", "),
                checks
            ),
            Self::Manual { message } => write!(f, "manual: {message}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Trip {
    reason: EmergencyReason,
    at: DateTime<Utc>,
}

/// Thread-safe: share via `Arc<EmergencyLatch>`.
#[derive(Debug, Default)]
pub struct EmergencyLatch {
    triggered: AtomicBool,
    trip: RwLock<Option<Trip>>,
}

impl EmergencyLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger the latch. Returns true for the call that actually tripped
    /// it; later triggers keep the original reason.
    pub fn trigger(&self, reason: EmergencyReason) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            error!(kind = "emergency", reason = %reason, "EMERGENCY STOP TRIGGERED");
            Metrics::emergency_stop();
            *self.trip.write() = Some(Trip {
                reason,
                at: Utc::now(),
            });
            true
        } else {
            warn!(new_reason = %reason, "Emergency latch already triggered, ignoring");
            false
        }
    }

    pub fn reason(&self) -> Option<EmergencyReason> {
        self.trip.read().as_ref().map(|t| t.reason.clone())
    }

    pub fn triggered_at(&self) -> Option<DateTime<Utc>> {
        self.trip.read().as_ref().map(|t| t.at)
    }

    /// Operator-only. There is no automatic reset.
    pub fn clear(&self) {
        if self.is_triggered() {
            let previous = self.trip.write().take();
            self.triggered.store(false, Ordering::SeqCst);
            info!(
                previous_reason = ?previous.map(|t| t.reason.to_string()),
                "Emergency latch cleared by operator"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_initially_clear() {
        let latch = EmergencyLatch::new();
        assert!(!latch.is_triggered());
        assert!(latch.reason().is_none());
        assert!(latch.triggered_at().is_none());
    }

    #[test]
    fn test_first_trigger_wins() {
        let latch = EmergencyLatch::new();
        let first = EmergencyReason::BreakersStuckOpen {
            breakers: vec!["orders".to_string()],
            checks: 3,
        };
        assert!(latch.trigger(first.clone()));
        assert!(!latch.trigger(EmergencyReason::Manual {
            message: "later".to_string()
        }));
        assert_eq!(latch.reason(), Some(first));
        assert!(latch.triggered_at().is_some());
    }

    #[test]
    fn test_clear() {
        let latch = EmergencyLatch::new();
        latch.trigger(EmergencyReason::Manual {
            message: "drill".to_string(),
        });
        latch.clear();
        assert!(!latch.is_triggered());
        assert!(latch.reason().is_none());
    }

    #[test]
    fn test_reason_display() {
        let reason = EmergencyReason::BreakersStuckOpen {
            breakers: vec!["ws-public".to_string(), "orders".to_string()],
            checks: 4,
        };
        assert_eq!(
            reason.to_string(),
            "breakers [ws-public, orders] open for 4 consecutive health checks"
        );
    }
}
