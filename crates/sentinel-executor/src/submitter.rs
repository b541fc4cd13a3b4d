//! Breaker-guarded submission of approved orders.

use crate::error::{ExecutorError, ExecutorResult};
use crate::gateway::{AccountSnapshot, DynOrderGateway, GatewayError, OrderAck};
use crate::nonce::NonceSource;
use sentinel_core::ClientOrderId;
use sentinel_resilience::CircuitBreaker;
use sentinel_risk::ApprovedOrder;
use sentinel_telemetry::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Extra attempts for transient gateway failures.
    pub transient_retries: u32,
    /// Delay before the first transient retry; doubles per retry.
    pub retry_delay: Duration,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            transient_retries: 2,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// The only path from the engine to the gateway.
///
/// Accepts [`ApprovedOrder`]s exclusively, so nothing the risk gate has
/// not cleared can be submitted.
pub struct OrderSubmitter {
    gateway: DynOrderGateway,
    nonces: Arc<NonceSource>,
    orders_breaker: Arc<CircuitBreaker>,
    account_breaker: Arc<CircuitBreaker>,
    config: SubmitterConfig,
}

impl OrderSubmitter {
    pub fn new(
        gateway: DynOrderGateway,
        nonces: Arc<NonceSource>,
        orders_breaker: Arc<CircuitBreaker>,
        account_breaker: Arc<CircuitBreaker>,
        config: SubmitterConfig,
    ) -> Self {
        Self {
            gateway,
            nonces,
            orders_breaker,
            account_breaker,
            config,
        }
    }

    /// Submit an approved order.
    ///
    /// Transient failures are retried up to `transient_retries` times with
    /// the same client order id. A rejected nonce triggers one resync and
    /// one more attempt; a second rejection is returned as
    /// [`ExecutorError::NonceRejected`].
    pub async fn submit(&self, order: &ApprovedOrder) -> ExecutorResult<OrderAck> {
        let request = order.request();
        let mut resynced = false;
        let mut transient_left = self.config.transient_retries;
        let mut delay = self.config.retry_delay;

        loop {
            let nonce = self.nonces.next();
            let result: ExecutorResult<OrderAck> = self
                .orders_breaker
                .call_classified(
                    || self.gateway.submit(request, nonce),
                    GatewayError::counts_as_failure,
                )
                .await
                .map_err(ExecutorError::from);

            match result {
                Ok(ack) => {
                    Metrics::order_result("accepted");
                    debug!(
                        cloid = %request.client_order_id,
                        exchange_id = %ack.exchange_order_id,
                        nonce,
                        "Order acknowledged"
                    );
                    return Ok(ack);
                }
                Err(ExecutorError::Gateway(GatewayError::InvalidNonce { message, floor })) => {
                    if resynced {
                        Metrics::order_result("nonce_rejected");
                        return Err(ExecutorError::NonceRejected(message));
                    }
                    resynced = true;
                    if let Some(floor) = floor {
                        self.nonces.fast_forward(floor);
                    }
                    warn!(
                        kind = "authentication",
                        cloid = %request.client_order_id,
                        nonce,
                        %message,
                        "Nonce rejected, resyncing and retrying once"
                    );
                }
                Err(ExecutorError::Gateway(e)) if e.kind().is_retryable() && transient_left > 0 => {
                    transient_left -= 1;
                    warn!(
                        kind = "retryable",
                        cloid = %request.client_order_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Transient submit failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    Metrics::order_result(e.kind().as_str());
                    return Err(e);
                }
            }
        }
    }

    /// Cancel all resting orders at the exchange.
    pub async fn cancel_all(&self) -> ExecutorResult<Vec<ClientOrderId>> {
        let nonce = self.nonces.next();
        let cancelled = self
            .orders_breaker
            .call_classified(
                || self.gateway.cancel_all(nonce),
                GatewayError::counts_as_failure,
            )
            .await?;
        info!(count = cancelled.len(), "Outstanding orders cancelled");
        Ok(cancelled)
    }

    /// Fetch the account's exposure for reconciliation.
    pub async fn account_snapshot(&self) -> ExecutorResult<AccountSnapshot> {
        let nonce = self.nonces.next();
        Ok(self
            .account_breaker
            .call_classified(
                || self.gateway.account_snapshot(nonce),
                GatewayError::counts_as_failure,
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockGateway, OrderStatus};
    use rust_decimal_macros::dec;
    use sentinel_core::{InstrumentId, Notional, OrderSide, Price, Signal};
    use sentinel_resilience::{BreakerConfig, BreakerState};
    use sentinel_risk::{ExposureLedger, RiskConfig, RiskGate};

    struct Harness {
        gateway: Arc<MockGateway>,
        submitter: OrderSubmitter,
        gate: RiskGate,
        orders_breaker: Arc<CircuitBreaker>,
    }

    fn harness(threshold: u32) -> Harness {
        let gateway = Arc::new(MockGateway::new());
        let orders_breaker = Arc::new(CircuitBreaker::new(
            "orders",
            BreakerConfig {
                failure_threshold: threshold,
                open_timeout: Duration::from_secs(30),
                call_timeout: Some(Duration::from_secs(5)),
            },
        ));
        let submitter = OrderSubmitter::new(
            gateway.clone(),
            Arc::new(NonceSource::with_system_clock()),
            orders_breaker.clone(),
            Arc::new(CircuitBreaker::new("account", BreakerConfig::default())),
            SubmitterConfig {
                transient_retries: 2,
                retry_delay: Duration::from_millis(10),
            },
        );
        let gate = RiskGate::new(RiskConfig::default(), Arc::new(ExposureLedger::new()));
        Harness {
            gateway,
            submitter,
            gate,
            orders_breaker,
        }
    }

    fn approved(h: &Harness) -> ApprovedOrder {
        h.gate
            .admit(&Signal::new(
                "test",
                InstrumentId::new("XLM/USD"),
                OrderSide::Buy,
                Notional::new(dec!(5)),
                Price::new(dec!(0.25)),
            ))
            .unwrap()
    }

    fn invalid_nonce() -> GatewayError {
        GatewayError::InvalidNonce {
            message: "EAPI:Invalid nonce".to_string(),
            floor: None,
        }
    }

    #[tokio::test]
    async fn test_submit_fills() {
        let h = harness(3);
        let order = approved(&h);
        let ack = h.submitter.submit(&order).await.unwrap();
        assert!(matches!(ack.status, OrderStatus::Filled(_)));
        assert_eq!(h.gateway.submits().len(), 1);
    }

    #[tokio::test]
    async fn test_nonce_resync_retries_once_with_fresh_nonce() {
        let h = harness(3);
        h.gateway.push_submit_result(Err(invalid_nonce()));
        let order = approved(&h);

        tokio_test::assert_ok!(h.submitter.submit(&order).await);
        let submits = h.gateway.submits();
        assert_eq!(submits.len(), 2);
        assert!(submits[1].1 > submits[0].1);
        assert_eq!(submits[0].0.client_order_id, submits[1].0.client_order_id);
    }

    #[tokio::test]
    async fn test_second_nonce_rejection_surfaces() {
        let h = harness(3);
        h.gateway.push_submit_result(Err(invalid_nonce()));
        h.gateway.push_submit_result(Err(invalid_nonce()));
        let order = approved(&h);

        let err = h.submitter.submit(&order).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NonceRejected(_)));
        assert_eq!(err.kind(), sentinel_core::FaultKind::Authentication);
        assert_eq!(h.gateway.submits().len(), 2);
    }

    #[tokio::test]
    async fn test_nonce_floor_hint_fast_forwards() {
        let h = harness(3);
        let floor = u64::MAX / 2;
        h.gateway.push_submit_result(Err(GatewayError::InvalidNonce {
            message: "behind".to_string(),
            floor: Some(floor),
        }));
        let order = approved(&h);

        h.submitter.submit(&order).await.unwrap();
        assert!(h.gateway.submits()[1].1 > floor);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_then_succeed() {
        let h = harness(5);
        h.gateway
            .push_submit_result(Err(GatewayError::Transient("reset".into())));
        h.gateway.push_submit_result(Err(GatewayError::RateLimited));
        let order = approved(&h);

        tokio_test::assert_ok!(h.submitter.submit(&order).await);
        assert_eq!(h.gateway.submits().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_trip_breaker() {
        let h = harness(3);
        for _ in 0..3 {
            h.gateway
                .push_submit_result(Err(GatewayError::Transient("down".into())));
        }
        let order = approved(&h);

        let err = h.submitter.submit(&order).await.unwrap_err();
        assert_eq!(err.kind(), sentinel_core::FaultKind::Retryable);
        assert_eq!(h.orders_breaker.state(), BreakerState::Open);

        let err = h.submitter.submit(&order).await.unwrap_err();
        assert!(matches!(err, ExecutorError::CircuitOpen(_)));
        assert_eq!(h.gateway.submits().len(), 3);
    }

    #[tokio::test]
    async fn test_business_rejection_does_not_trip_breaker() {
        let h = harness(1);
        h.gateway
            .push_submit_result(Err(GatewayError::Rejected("insufficient funds".into())));
        let order = approved(&h);

        let err = h.submitter.submit(&order).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Gateway(GatewayError::Rejected(_))));
        assert_eq!(h.orders_breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_all_uses_gateway() {
        let h = harness(3);
        h.submitter.cancel_all().await.unwrap();
        assert_eq!(h.gateway.cancel_calls(), 1);
    }
}
