//! Pre-trade risk controls.
//!
//! Every order leaving the process passes through here first:
//! - `RiskGate`: position-size and exposure ceilings, evaluated atomically
//!   with the ledger reservation
//! - `ExposureLedger`: committed notional per instrument, reserve /
//!   settle / release bookkeeping and reconciliation support
//! - `EmergencyLatch`: kill-switch state that only an operator clears

pub mod emergency;
pub mod error;
pub mod gate;
pub mod ledger;

pub use emergency::{EmergencyLatch, EmergencyReason};
pub use error::{RiskError, RiskResult};
pub use gate::{ApprovedOrder, ExposureScope, OrderIntent, RiskConfig, RiskDecision, RiskGate};
pub use ledger::{
    Drift, ExposureBreach, ExposureLedger, ReconcileReport, Reservation, ReservationState,
};
