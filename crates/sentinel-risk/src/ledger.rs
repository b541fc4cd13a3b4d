//! Committed exposure bookkeeping.
//!
//! A reservation moves through `Pending` (order accepted by the gate,
//! not yet filled) and `Settled` (filled, backing an open position) and
//! is removed by exactly one `release`. A submission whose outcome is
//! unknown parks its reservation in `Unresolved`; it keeps counting
//! against the ceilings until a fill settles it or a cancel releases it.
//! The check that a new reservation
//! fits under the ceiling and its insertion happen under one lock, so
//! concurrent evaluations can never jointly overshoot.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use sentinel_core::{InstrumentId, Notional, ReservationId};
use sentinel_telemetry::Metrics;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Pending,
    Unresolved,
    Settled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: ReservationId,
    pub instrument: InstrumentId,
    pub amount: Notional,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    age_origin: Instant,
}

impl Reservation {
    pub fn age(&self) -> Duration {
        self.age_origin.elapsed()
    }
}

/// A reservation would push exposure past its ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureBreach {
    pub current: Notional,
    pub requested: Notional,
    pub ceiling: Notional,
}

/// Ledger vs. external account disagreement for one instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub instrument: InstrumentId,
    pub ledger: Notional,
    pub external: Notional,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub drifts: Vec<Drift>,
    /// Settled reservations released because the account no longer holds
    /// the position.
    pub released: Vec<ReservationId>,
    /// Instruments skipped because a fill settled after the snapshot.
    pub deferred: Vec<InstrumentId>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.drifts.is_empty() && self.released.is_empty()
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    reservations: HashMap<ReservationId, Reservation>,
    by_instrument: HashMap<InstrumentId, Notional>,
    total: Notional,
}

impl LedgerInner {
    fn instrument_total(&self, instrument: &InstrumentId) -> Notional {
        self.by_instrument
            .get(instrument)
            .copied()
            .unwrap_or(Notional::ZERO)
    }

    fn remove(&mut self, id: &ReservationId) -> Option<Reservation> {
        let reservation = self.reservations.remove(id)?;
        let remaining = self
            .instrument_total(&reservation.instrument)
            .saturating_sub(reservation.amount);
        if remaining.is_zero() {
            self.by_instrument.remove(&reservation.instrument);
        } else {
            self.by_instrument
                .insert(reservation.instrument.clone(), remaining);
        }
        self.total = self.total.saturating_sub(reservation.amount);
        Some(reservation)
    }

    fn publish(&self) {
        Metrics::ledger_levels(
            self.total.inner().to_f64().unwrap_or(0.0),
            self.reservations.len() as i64,
        );
    }
}

/// Per-instrument committed notional. Share via `Arc<ExposureLedger>`.
#[derive(Debug, Default)]
pub struct ExposureLedger {
    inner: Mutex<LedgerInner>,
}

impl ExposureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check and reserve.
    ///
    /// `instrument_ceiling` bounds the instrument's own committed notional,
    /// `aggregate_ceiling` bounds the sum across instruments. Either may be
    /// absent; the reservation fails if any present ceiling would be
    /// exceeded.
    pub fn reserve_within(
        &self,
        instrument: &InstrumentId,
        amount: Notional,
        instrument_ceiling: Option<Notional>,
        aggregate_ceiling: Option<Notional>,
    ) -> Result<ReservationId, ExposureBreach> {
        let mut inner = self.inner.lock();

        if let Some(ceiling) = instrument_ceiling {
            let current = inner.instrument_total(instrument);
            if current + amount > ceiling {
                return Err(ExposureBreach {
                    current,
                    requested: amount,
                    ceiling,
                });
            }
        }
        if let Some(ceiling) = aggregate_ceiling {
            let current = inner.total;
            if current + amount > ceiling {
                return Err(ExposureBreach {
                    current,
                    requested: amount,
                    ceiling,
                });
            }
        }

        let id = ReservationId::new();
        inner.reservations.insert(
            id,
            Reservation {
                id,
                instrument: instrument.clone(),
                amount,
                state: ReservationState::Pending,
                created_at: Utc::now(),
                settled_at: None,
                age_origin: Instant::now(),
            },
        );
        *inner
            .by_instrument
            .entry(instrument.clone())
            .or_insert(Notional::ZERO) += amount;
        inner.total += amount;
        inner.publish();

        debug!(reservation = %id, instrument = %instrument, amount = %amount, total = %inner.total, "Exposure reserved");
        Ok(id)
    }

    /// Mark a reservation as backing a filled position. Returns false if it
    /// is unknown (already released).
    pub fn settle(&self, id: ReservationId) -> bool {
        let mut inner = self.inner.lock();
        match inner.reservations.get_mut(&id) {
            Some(r) => {
                if r.state != ReservationState::Settled {
                    r.state = ReservationState::Settled;
                    r.settled_at = Some(Utc::now());
                }
                true
            }
            None => {
                warn!(reservation = %id, "Settle for unknown reservation");
                false
            }
        }
    }

    /// Keep a pending reservation whose order may or may not have reached
    /// the exchange. Returns false unless the reservation was pending.
    pub fn mark_unresolved(&self, id: ReservationId) -> bool {
        let mut inner = self.inner.lock();
        let total = inner.total;
        match inner.reservations.get_mut(&id) {
            Some(r) if r.state == ReservationState::Pending => {
                r.state = ReservationState::Unresolved;
                warn!(reservation = %id, instrument = %r.instrument, amount = %r.amount, total = %total, "Exposure kept unresolved");
                true
            }
            Some(r) => {
                debug!(reservation = %id, state = ?r.state, "Only pending reservations can become unresolved");
                false
            }
            None => {
                warn!(reservation = %id, "Unresolved mark for unknown reservation");
                false
            }
        }
    }

    /// Return a reservation's notional to the pool. A second release of the
    /// same id changes nothing and is reported as a bookkeeping bug.
    pub fn release(&self, id: ReservationId) -> Option<Notional> {
        let mut inner = self.inner.lock();
        match inner.remove(&id) {
            Some(r) => {
                inner.publish();
                debug!(reservation = %id, instrument = %r.instrument, amount = %r.amount, total = %inner.total, "Exposure released");
                Some(r.amount)
            }
            None => {
                drop(inner);
                Metrics::ledger_anomaly("double_release");
                error!(reservation = %id, "Release of unknown or already-released reservation");
                None
            }
        }
    }

    pub fn total(&self) -> Notional {
        self.inner.lock().total
    }

    pub fn instrument_total(&self, instrument: &InstrumentId) -> Notional {
        self.inner.lock().instrument_total(instrument)
    }

    pub fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.inner.lock().reservations.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exposures(&self) -> HashMap<InstrumentId, Notional> {
        self.inner.lock().by_instrument.clone()
    }

    /// Pending reservations older than `max_age`. A reservation that is
    /// never settled or released is a leak.
    pub fn stale_pending(&self, max_age: Duration) -> Vec<Reservation> {
        self.inner
            .lock()
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Pending && r.age() >= max_age)
            .cloned()
            .collect()
    }

    pub fn unresolved(&self) -> Vec<Reservation> {
        self.inner
            .lock()
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Unresolved)
            .cloned()
            .collect()
    }

    /// Compare settled exposure against the account's view as of `as_of`.
    ///
    /// Instruments where the account holds nothing but the ledger still
    /// has settled reservations get those reservations released. Any other
    /// disagreement beyond `tolerance` is reported as drift, not corrected.
    /// An instrument with a settlement newer than `as_of` cannot be judged
    /// from this snapshot and is left alone.
    pub fn reconcile(
        &self,
        external: &HashMap<InstrumentId, Notional>,
        tolerance: Notional,
        as_of: DateTime<Utc>,
    ) -> ReconcileReport {
        let mut inner = self.inner.lock();
        let mut report = ReconcileReport::default();

        let mut settled: HashMap<InstrumentId, (Notional, Vec<ReservationId>)> = HashMap::new();
        for r in inner.reservations.values() {
            if r.state != ReservationState::Settled {
                continue;
            }
            if r.settled_at.is_some_and(|at| at > as_of) {
                if !report.deferred.contains(&r.instrument) {
                    report.deferred.push(r.instrument.clone());
                }
                continue;
            }
            let entry = settled
                .entry(r.instrument.clone())
                .or_insert((Notional::ZERO, Vec::new()));
            entry.0 += r.amount;
            entry.1.push(r.id);
        }
        for instrument in &report.deferred {
            settled.remove(instrument);
            debug!(instrument = %instrument, as_of = %as_of, "Settled after snapshot, reconciliation deferred");
        }

        for (instrument, (ledger_amount, ids)) in &settled {
            let held = external.get(instrument).copied().unwrap_or(Notional::ZERO);
            if held.is_zero() {
                for id in ids {
                    inner.remove(id);
                    report.released.push(*id);
                }
                Metrics::ledger_anomaly("orphaned_settlement");
                warn!(
                    instrument = %instrument,
                    released = ids.len(),
                    amount = %ledger_amount,
                    "Account holds no position; released settled reservations"
                );
            } else if diff(*ledger_amount, held) > tolerance {
                report.drifts.push(Drift {
                    instrument: instrument.clone(),
                    ledger: *ledger_amount,
                    external: held,
                });
            }
        }

        for (instrument, held) in external {
            if !settled.contains_key(instrument)
                && !report.deferred.contains(instrument)
                && *held > tolerance
            {
                report.drifts.push(Drift {
                    instrument: instrument.clone(),
                    ledger: Notional::ZERO,
                    external: *held,
                });
            }
        }

        for drift in &report.drifts {
            Metrics::ledger_anomaly("drift");
            warn!(
                instrument = %drift.instrument,
                ledger = %drift.ledger,
                external = %drift.external,
                "Exposure drift between ledger and account"
            );
        }
        if !report.released.is_empty() {
            inner.publish();
            info!(total = %inner.total, "Ledger corrected by reconciliation");
        }
        report
    }
}

fn diff(a: Notional, b: Notional) -> Notional {
    if a > b {
        a - b
    } else {
        b - a
    }
}
