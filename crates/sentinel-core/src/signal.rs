//! Candidate trade produced by a strategy.

use crate::{InstrumentId, Notional, OrderSide, OrderType, Price};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A proposed trade. Consumed once by the risk gate, then discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: InstrumentId,
    pub direction: OrderSide,
    /// Proposed size in quote currency.
    pub size: Notional,
    /// Price the strategy observed when producing the signal.
    pub reference_price: Price,
    pub order_type: OrderType,
    pub strategy_id: String,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        strategy_id: impl Into<String>,
        instrument: InstrumentId,
        direction: OrderSide,
        size: Notional,
        reference_price: Price,
    ) -> Self {
        Self {
            instrument,
            direction,
            size,
            reference_price,
            order_type: OrderType::Market,
            strategy_id: strategy_id.into(),
            stop_loss: None,
            take_profit: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_order_type(mut self, order_type: OrderType) -> Self {
        self.order_type = order_type;
        self
    }

    pub fn with_exits(mut self, stop_loss: Option<Price>, take_profit: Option<Price>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }
}
