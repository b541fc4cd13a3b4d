//! Core domain types for the sentinel trading core.
//!
//! This crate provides fundamental types used throughout the system:
//! - `InstrumentId`: exchange symbol such as `XLM/USD`
//! - `Price`, `Size`: precision-safe numeric types
//! - `Signal`, `OrderRequest`, `Position`: the trading pipeline payloads
//! - `FaultKind`: the closed error taxonomy every crate reports against

pub mod decimal;
pub mod error;
pub mod fault;
pub mod instrument;
pub mod order;
pub mod position;
pub mod signal;
pub mod types;

pub use decimal::{Notional, Price, Size};
pub use error::{CoreError, Result};
pub use fault::FaultKind;
pub use instrument::InstrumentId;
pub use order::{ClientOrderId, OrderRequest, OrderSide, OrderType};
pub use position::{Position, PositionId, ReservationId};
pub use signal::Signal;
pub use types::Quote;
