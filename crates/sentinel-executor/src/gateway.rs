//! Order gateway trait for the external submission boundary.
//!
//! The gateway owns transport and per-endpoint serialization; this crate
//! only supplies the order, a fresh nonce, and failure isolation around
//! the call. Keeping it a trait allows:
//! - dependency injection for testing
//! - a paper implementation for dry runs
//! - swapping the live transport without touching the engine

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sentinel_core::{ClientOrderId, FaultKind, InstrumentId, Notional, OrderRequest, Price, Size};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub price: Price,
    pub quantity: Size,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    /// Executed in full on submission.
    Filled(Fill),
    /// Accepted and resting; the outcome arrives on the executions stream.
    Resting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: String,
    pub status: OrderStatus,
}

/// The account's view of open exposure and balances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub exposures: HashMap<InstrumentId, Notional>,
    pub balances: HashMap<String, Decimal>,
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited")]
    RateLimited,

    /// Stale or duplicate nonce. `floor`, when known, is the value the
    /// exchange expects to be exceeded.
    #[error("invalid nonce: {message}")]
    InvalidNonce { message: String, floor: Option<u64> },

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl GatewayError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Transient(_) | Self::RateLimited => FaultKind::Retryable,
            Self::InvalidNonce { .. } | Self::Authentication(_) => FaultKind::Authentication,
            Self::Rejected(_) => FaultKind::RiskViolation,
        }
    }

    /// Whether the failure says something about the counterparty's health
    /// (and should count against its breaker).
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited)
    }
}

/// Transport to the exchange's private endpoints.
pub trait OrderGateway: Send + Sync {
    fn submit<'a>(
        &'a self,
        order: &'a OrderRequest,
        nonce: u64,
    ) -> BoxFuture<'a, Result<OrderAck, GatewayError>>;

    /// Cancel every resting order; returns the cancelled client ids.
    fn cancel_all(&self, nonce: u64) -> BoxFuture<'_, Result<Vec<ClientOrderId>, GatewayError>>;

    fn account_snapshot(&self, nonce: u64) -> BoxFuture<'_, Result<AccountSnapshot, GatewayError>>;
}

/// Arc wrapper for gateway trait objects.
pub type DynOrderGateway = Arc<dyn OrderGateway>;

/// Scripted gateway for tests.
///
/// Queued results are consumed in order; once the queue is empty every
/// submit fills at the order's price.
#[derive(Debug, Default)]
pub struct MockGateway {
    submits: Mutex<Vec<(OrderRequest, u64)>>,
    submit_results: Mutex<VecDeque<Result<OrderStatus, GatewayError>>>,
    cancel_calls: Mutex<Vec<u64>>,
    cancel_result: Mutex<Option<GatewayError>>,
    snapshot: Mutex<AccountSnapshot>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next submit.
    pub fn push_submit_result(&self, result: Result<OrderStatus, GatewayError>) {
        self.submit_results.lock().push_back(result);
    }

    pub fn fail_cancels(&self, error: GatewayError) {
        *self.cancel_result.lock() = Some(error);
    }

    pub fn set_snapshot(&self, snapshot: AccountSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn submits(&self) -> Vec<(OrderRequest, u64)> {
        self.submits.lock().clone()
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.lock().len()
    }
}

impl OrderGateway for MockGateway {
    fn submit<'a>(
        &'a self,
        order: &'a OrderRequest,
        nonce: u64,
    ) -> BoxFuture<'a, Result<OrderAck, GatewayError>> {
        Box::pin(async move {
            self.submits.lock().push((order.clone(), nonce));
            let scripted = self.submit_results.lock().pop_front();
            let status = match scripted {
                Some(result) => result?,
                None => OrderStatus::Filled(Fill {
                    price: order.price.unwrap_or(Price::ZERO),
                    quantity: order.size,
                }),
            };
            Ok(OrderAck {
                client_order_id: order.client_order_id.clone(),
                exchange_order_id: format!("MOCK-{nonce}"),
                status,
            })
        })
    }

    fn cancel_all(&self, nonce: u64) -> BoxFuture<'_, Result<Vec<ClientOrderId>, GatewayError>> {
        Box::pin(async move {
            self.cancel_calls.lock().push(nonce);
            match self.cancel_result.lock().clone() {
                Some(err) => Err(err),
                None => Ok(Vec::new()),
            }
        })
    }

    fn account_snapshot(&self, _nonce: u64) -> BoxFuture<'_, Result<AccountSnapshot, GatewayError>> {
        Box::pin(async move { Ok(self.snapshot.lock().clone()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sentinel_core::OrderSide;

    #[test]
    fn test_error_classification() {
        assert!(GatewayError::Transient("reset".into()).counts_as_failure());
        assert!(GatewayError::RateLimited.counts_as_failure());
        assert!(!GatewayError::Rejected("margin".into()).counts_as_failure());
        assert_eq!(
            GatewayError::InvalidNonce {
                message: "EAPI:Invalid nonce".into(),
                floor: None
            }
            .kind(),
            FaultKind::Authentication
        );
    }

    #[tokio::test]
    async fn test_mock_gateway_scripted_then_default() {
        let gw = MockGateway::new();
        gw.push_submit_result(Err(GatewayError::RateLimited));

        let order = OrderRequest::market(
            InstrumentId::new("XLM/USD"),
            OrderSide::Buy,
            Size::new(dec!(10)),
        )
        .with_price(Price::new(dec!(0.25)));

        assert_eq!(
            gw.submit(&order, 1).await.unwrap_err(),
            GatewayError::RateLimited
        );
        let ack = gw.submit(&order, 2).await.unwrap();
        assert!(matches!(ack.status, OrderStatus::Filled(_)));
        assert_eq!(gw.submits().len(), 2);
    }
}
