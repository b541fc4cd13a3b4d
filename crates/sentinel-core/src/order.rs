//! Order-related types and identifiers.
//!
//! Provides order side, type, client order ID and the request shape
//! handed to the order-submission boundary.

use crate::{InstrumentId, Price, Size};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell (for position calculations).
    pub fn sign(&self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type as understood by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

impl OrderType {
    /// Whether an accepted order of this type may rest on the book and
    /// therefore needs cancelling on shutdown.
    pub fn can_rest(&self) -> bool {
        !matches!(self, Self::Market)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
            Self::StopLoss => write!(f, "stop-loss"),
            Self::TakeProfit => write!(f, "take-profit"),
        }
    }
}

/// Client order ID for idempotency.
///
/// Every order carries a unique cloid so that a retried submission is
/// recognisable as the same order by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Create a new unique client order ID.
    ///
    /// Format: `snt_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().simple().to_string()[..8];
        Self(format!("snt_{ts}_{uuid_short}"))
    }

    /// Create from an existing string (for parsing responses).
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

/// Order handed to the external submission boundary:
/// `(instrument, side, size, orderType)` plus the fields needed to
/// price and identify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: ClientOrderId,
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub size: Size,
    pub order_type: OrderType,
    /// Required for limit-style orders, reference price for market orders.
    pub price: Option<Price>,
    /// Closing order; may only reduce an existing position.
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(instrument: InstrumentId, side: OrderSide, size: Size) -> Self {
        Self {
            client_order_id: ClientOrderId::new(),
            instrument,
            side,
            size,
            order_type: OrderType::Market,
            price: None,
            reduce_only: false,
        }
    }

    pub fn limit(instrument: InstrumentId, side: OrderSide, size: Size, price: Price) -> Self {
        Self {
            client_order_id: ClientOrderId::new(),
            instrument,
            side,
            size,
            order_type: OrderType::Limit,
            price: Some(price),
            reduce_only: false,
        }
    }

    pub fn with_price(mut self, price: Price) -> Self {
        self.price = Some(price);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_order_side_sign() {
        assert_eq!(OrderSide::Buy.sign(), 1);
        assert_eq!(OrderSide::Sell.sign(), -1);
    }

    #[test]
    fn test_client_order_id_unique() {
        let id1 = ClientOrderId::new();
        let id2 = ClientOrderId::new();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("snt_"));
    }

    #[test]
    fn test_order_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&OrderType::StopLoss).unwrap(),
            "\"stop-loss\""
        );
        assert_eq!(OrderType::TakeProfit.to_string(), "take-profit");
        assert!(!OrderType::Market.can_rest());
        assert!(OrderType::Limit.can_rest());
    }

    #[test]
    fn test_limit_builder() {
        let order = OrderRequest::limit(
            InstrumentId::new("XLM/USD"),
            OrderSide::Sell,
            Size::new(dec!(40)),
            Price::new(dec!(0.26)),
        )
        .reduce_only();
        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.price, Some(Price::new(dec!(0.26))));
        assert!(order.reduce_only);
    }
}
