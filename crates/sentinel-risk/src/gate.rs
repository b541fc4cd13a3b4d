//! Pre-trade risk gate.
//!
//! Gate order (first failing check wins):
//! 1. size > max_position_size (or non-positive) -> RejectedPositionSize
//! 2. committed + size > max_total_exposure      -> RejectedExposure
//! 3. reserve in the ledger                      -> Accepted(reservation)
//!
//! Steps 2 and 3 run under the ledger's lock, so two concurrent signals
//! can never both squeeze under the same remaining headroom.

use crate::ledger::ExposureLedger;
use sentinel_core::{
    FaultKind, InstrumentId, Notional, OrderRequest, OrderType, Position, Price, ReservationId,
    Signal,
};
use sentinel_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// What `max_total_exposure` is measured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureScope {
    /// Sum of committed notional across all instruments.
    #[default]
    Aggregate,
    /// Committed notional of the signal's instrument only.
    PerInstrument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskConfig {
    pub max_position_size: Notional,
    pub max_total_exposure: Notional,
    pub exposure_scope: ExposureScope,
    /// Additional aggregate cap when the scope is per-instrument.
    pub max_aggregate_exposure: Option<Notional>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: Notional::new(10.into()),
            max_total_exposure: Notional::new(10.into()),
            exposure_scope: ExposureScope::Aggregate,
            max_aggregate_exposure: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    Accepted(ReservationId),
    RejectedPositionSize,
    RejectedExposure,
}

impl RiskDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted(_) => "accepted",
            Self::RejectedPositionSize => "rejected_position_size",
            Self::RejectedExposure => "rejected_exposure",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn kind(&self) -> Option<FaultKind> {
        match self {
            Self::Accepted(_) => None,
            _ => Some(FaultKind::RiskViolation),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderIntent {
    /// Adds exposure; backed by a fresh pending reservation.
    Open,
    /// Reduces an existing position; carries that position's reservation.
    Close,
}

/// An order cleared by the gate. Only the gate constructs these, and the
/// submission boundary accepts nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedOrder {
    request: OrderRequest,
    reservation: ReservationId,
    notional: Notional,
    intent: OrderIntent,
}

impl ApprovedOrder {
    pub fn request(&self) -> &OrderRequest {
        &self.request
    }

    pub fn reservation(&self) -> ReservationId {
        self.reservation
    }

    pub fn notional(&self) -> Notional {
        self.notional
    }

    pub fn intent(&self) -> OrderIntent {
        self.intent
    }

    pub fn instrument(&self) -> &InstrumentId {
        &self.request.instrument
    }
}

pub struct RiskGate {
    config: RiskConfig,
    ledger: Arc<ExposureLedger>,
}

impl RiskGate {
    pub fn new(config: RiskConfig, ledger: Arc<ExposureLedger>) -> Self {
        Self { config, ledger }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ExposureLedger> {
        &self.ledger
    }

    /// Evaluate a signal and, if it fits, reserve its exposure.
    pub fn evaluate(&self, signal: &Signal) -> RiskDecision {
        let decision = self.decide(signal);
        Metrics::risk_decision(decision.as_str());
        match decision {
            RiskDecision::Accepted(id) => debug!(
                instrument = %signal.instrument,
                strategy = %signal.strategy_id,
                size = %signal.size,
                reservation = %id,
                "Signal accepted"
            ),
            rejected => warn!(
                kind = FaultKind::RiskViolation.as_str(),
                decision = rejected.as_str(),
                instrument = %signal.instrument,
                strategy = %signal.strategy_id,
                size = %signal.size,
                committed = %self.committed_for(&signal.instrument),
                "Signal rejected"
            ),
        }
        decision
    }

    /// Evaluate and turn an acceptance into a submittable order.
    pub fn admit(&self, signal: &Signal) -> Result<ApprovedOrder, RiskDecision> {
        let quantity = match signal.size.quantity_at(signal.reference_price) {
            Some(q) if q.is_positive() => q,
            _ => {
                Metrics::risk_decision(RiskDecision::RejectedPositionSize.as_str());
                warn!(
                    kind = FaultKind::RiskViolation.as_str(),
                    instrument = %signal.instrument,
                    price = %signal.reference_price,
                    "Signal has no usable reference price"
                );
                return Err(RiskDecision::RejectedPositionSize);
            }
        };

        match self.evaluate(signal) {
            RiskDecision::Accepted(reservation) => {
                let mut request = OrderRequest::market(
                    signal.instrument.clone(),
                    signal.direction,
                    quantity,
                );
                request.order_type = signal.order_type;
                request.price = Some(signal.reference_price);
                Ok(ApprovedOrder {
                    request,
                    reservation,
                    notional: signal.size,
                    intent: OrderIntent::Open,
                })
            }
            rejected => Err(rejected),
        }
    }

    /// Clear a reduce-only order that flattens `position`. Closing orders
    /// never add exposure, so no ceiling applies.
    pub fn admit_close(
        &self,
        position: &Position,
        order_type: OrderType,
        price: Price,
    ) -> ApprovedOrder {
        let mut request = OrderRequest::market(
            position.instrument.clone(),
            position.exit_side(),
            position.quantity,
        )
        .with_price(price)
        .reduce_only();
        request.order_type = order_type;
        ApprovedOrder {
            request,
            reservation: position.reservation,
            notional: position.quantity.notional(price),
            intent: OrderIntent::Close,
        }
    }

    fn decide(&self, signal: &Signal) -> RiskDecision {
        if !signal.size.is_positive() || signal.size > self.config.max_position_size {
            return RiskDecision::RejectedPositionSize;
        }

        let (instrument_ceiling, aggregate_ceiling) = match self.config.exposure_scope {
            ExposureScope::Aggregate => (None, Some(self.config.max_total_exposure)),
            ExposureScope::PerInstrument => (
                Some(self.config.max_total_exposure),
                self.config.max_aggregate_exposure,
            ),
        };

        match self.ledger.reserve_within(
            &signal.instrument,
            signal.size,
            instrument_ceiling,
            aggregate_ceiling,
        ) {
            Ok(id) => RiskDecision::Accepted(id),
            Err(_) => RiskDecision::RejectedExposure,
        }
    }

    fn committed_for(&self, instrument: &InstrumentId) -> Notional {
        match self.config.exposure_scope {
            ExposureScope::Aggregate => self.ledger.total(),
            ExposureScope::PerInstrument => self.ledger.instrument_total(instrument),
        }
    }
}
