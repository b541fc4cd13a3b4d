//! Failure isolation for external operations.
//!
//! One [`CircuitBreaker`] guards one operation family (a connection
//! session, order submission, account reconciliation). Breakers are
//! owned objects handed around by `Arc`; the [`BreakerRegistry`] lets the
//! engine's health monitor observe all of them without owning them.

pub mod breaker;
pub mod error;
pub mod registry;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use error::{CallError, CircuitOpenError};
pub use registry::BreakerRegistry;
