//! Open positions and the identifiers that tie them to exposure
//! reservations.

use crate::{InstrumentId, Notional, OrderSide, Price, Size};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Handle for a slice of committed exposure in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsv_{}", &self.0.simple().to_string()[..12])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(Uuid);

impl PositionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PositionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos_{}", &self.0.simple().to_string()[..12])
    }
}

/// A filled entry. Created on fill, removed when fully exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub quantity: Size,
    pub entry_price: Price,
    /// Ledger reservation settled by this position; released on close.
    pub reservation: ReservationId,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub strategy_id: String,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Signed quantity: positive long, negative short.
    pub fn signed_quantity(&self) -> Decimal {
        self.quantity.inner() * Decimal::from(self.side.sign())
    }

    /// Notional at entry.
    pub fn entry_notional(&self) -> Notional {
        self.quantity.notional(self.entry_price)
    }

    /// Side of the order that closes this position.
    pub fn exit_side(&self) -> OrderSide {
        self.side.opposite()
    }

    /// Unrealized PnL in quote currency at `mark`.
    pub fn unrealized_pnl(&self, mark: Price) -> Decimal {
        (mark.inner() - self.entry_price.inner()) * self.signed_quantity()
    }
}
