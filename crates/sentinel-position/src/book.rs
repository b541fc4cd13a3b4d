//! Position book.
//!
//! Tracks three things that the engine loops and the stream dispatcher
//! touch concurrently:
//! - open positions (PositionId -> Position)
//! - entry orders resting on the exchange, keyed by client order id,
//!   with the details needed to open a position when they fill
//! - closing orders in flight, so a position is never exited twice

use crate::error::{PositionError, PositionResult};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sentinel_core::{
    ClientOrderId, InstrumentId, OrderSide, Position, PositionId, Price, ReservationId, Size,
};
use sentinel_telemetry::Metrics;
use tracing::{debug, info, warn};

/// What an entry order turns into once it fills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub reservation: ReservationId,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub strategy_id: String,
}

impl PendingEntry {
    fn into_position(self, price: Price, quantity: Size) -> Position {
        Position {
            id: PositionId::new(),
            instrument: self.instrument,
            side: self.side,
            quantity,
            entry_price: price,
            reservation: self.reservation,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            strategy_id: self.strategy_id,
            opened_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
struct RestingEntry {
    entry: PendingEntry,
    /// Position opened by the first partial fill, if any.
    position: Option<PositionId>,
}

fn validate_fill(price: Price, quantity: Size) -> PositionResult<()> {
    if !price.is_positive() || !quantity.is_positive() {
        return Err(PositionError::InvalidFill(format!(
            "price={price} quantity={quantity}"
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct PositionBook {
    positions: DashMap<PositionId, Position>,
    entries: DashMap<ClientOrderId, RestingEntry>,
    closing: DashMap<PositionId, ClientOrderId>,
    closing_orders: DashMap<ClientOrderId, PositionId>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a position from an entry that filled on submission.
    pub fn open(&self, entry: PendingEntry, price: Price, quantity: Size) -> PositionResult<Position> {
        validate_fill(price, quantity)?;
        let position = entry.into_position(price, quantity);
        self.insert(position.clone());
        Ok(position)
    }

    /// Remember an entry order that rests on the book until the
    /// executions stream reports its outcome.
    pub fn track_entry(&self, cloid: ClientOrderId, entry: PendingEntry) {
        debug!(cloid = %cloid, instrument = %entry.instrument, "Tracking resting entry");
        self.entries.insert(
            cloid,
            RestingEntry {
                entry,
                position: None,
            },
        );
    }

    /// Apply a fill of a resting entry order.
    ///
    /// The first fill opens a position; later partial fills grow it at the
    /// volume-weighted entry price. Returns `None` for an unknown order id.
    pub fn on_entry_fill(
        &self,
        cloid: &ClientOrderId,
        price: Price,
        quantity: Size,
    ) -> PositionResult<Option<Position>> {
        validate_fill(price, quantity)?;
        let Some(mut resting) = self.entries.get_mut(cloid) else {
            return Ok(None);
        };

        if let Some(id) = resting.position {
            let Some(mut position) = self.positions.get_mut(&id) else {
                warn!(cloid = %cloid, position = %id, "Fill for a position that was already closed");
                return Ok(None);
            };
            let old_qty = position.quantity.inner();
            let new_qty = old_qty + quantity.inner();
            let vwap =
                (position.entry_price.inner() * old_qty + price.inner() * quantity.inner()) / new_qty;
            position.quantity = Size::new(new_qty);
            position.entry_price = Price::new(vwap);
            debug!(position = %id, quantity = %position.quantity, "Partial fill merged");
            return Ok(Some(position.clone()));
        }

        let position = resting.entry.clone().into_position(price, quantity);
        resting.position = Some(position.id);
        drop(resting);
        self.insert(position.clone());
        Ok(Some(position))
    }

    /// The entry order is done filling; stop tracking it.
    pub fn complete_entry(&self, cloid: &ClientOrderId) {
        self.entries.remove(cloid);
    }

    /// The entry order left the book. Returns the reservation to release
    /// when nothing filled; a partially filled order keeps its reservation
    /// for the position it opened.
    pub fn cancel_entry(&self, cloid: &ClientOrderId) -> Option<ReservationId> {
        let (_, resting) = self.entries.remove(cloid)?;
        match resting.position {
            None => Some(resting.entry.reservation),
            Some(id) => {
                debug!(cloid = %cloid, position = %id, "Partially filled entry cancelled");
                None
            }
        }
    }

    pub fn is_entry(&self, cloid: &ClientOrderId) -> bool {
        self.entries.contains_key(cloid)
    }

    pub fn resting_entries(&self) -> Vec<ClientOrderId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Claim a position for exit by `cloid`. Fails if another closing
    /// order is already in flight for it.
    pub fn begin_close(&self, id: PositionId, cloid: ClientOrderId) -> PositionResult<Position> {
        let position = self
            .positions
            .get(&id)
            .map(|p| p.clone())
            .ok_or(PositionError::NotFound(id))?;
        match self.closing.entry(id) {
            Entry::Occupied(_) => return Err(PositionError::AlreadyClosing(id)),
            Entry::Vacant(slot) => {
                slot.insert(cloid.clone());
            }
        }
        self.closing_orders.insert(cloid, id);
        Ok(position)
    }

    /// Give up on an exit (submit failed or the closing order was cancelled).
    pub fn abort_close(&self, id: PositionId) {
        if let Some((_, cloid)) = self.closing.remove(&id) {
            self.closing_orders.remove(&cloid);
        }
    }

    pub fn is_closing(&self, id: PositionId) -> bool {
        self.closing.contains_key(&id)
    }

    /// Position a resting closing order belongs to.
    pub fn closing_position(&self, cloid: &ClientOrderId) -> Option<PositionId> {
        self.closing_orders.get(cloid).map(|e| *e)
    }

    /// Remove a fully exited position.
    pub fn close(&self, id: PositionId) -> Option<Position> {
        self.abort_close(id);
        let (_, position) = self.positions.remove(&id)?;
        self.entries.retain(|_, r| r.position != Some(id));
        Metrics::positions_open(self.positions.len() as i64);
        info!(
            position = %id,
            instrument = %position.instrument,
            side = %position.side,
            quantity = %position.quantity,
            "Position closed"
        );
        Some(position)
    }

    /// Drop positions whose reservations the ledger released during
    /// reconciliation (the account no longer holds them).
    pub fn remove_by_reservation(&self, released: &[ReservationId]) -> Vec<Position> {
        if released.is_empty() {
            return Vec::new();
        }
        let ids: Vec<PositionId> = self
            .positions
            .iter()
            .filter(|p| released.contains(&p.reservation))
            .map(|p| p.id)
            .collect();
        let removed: Vec<Position> = ids.into_iter().filter_map(|id| self.close(id)).collect();
        if !removed.is_empty() {
            warn!(count = removed.len(), "Positions dropped after reconciliation");
        }
        removed
    }

    pub fn get(&self, id: PositionId) -> Option<Position> {
        self.positions.get(&id).map(|p| p.clone())
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.iter().map(|p| p.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn insert(&self, position: Position) {
        info!(
            position = %position.id,
            instrument = %position.instrument,
            side = %position.side,
            quantity = %position.quantity,
            entry_price = %position.entry_price,
            reservation = %position.reservation,
            "Position opened"
        );
        self.positions.insert(position.id, position);
        Metrics::positions_open(self.positions.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(side: OrderSide) -> PendingEntry {
        PendingEntry {
            instrument: InstrumentId::new("XLM/USD"),
            side,
            reservation: ReservationId::new(),
            stop_loss: None,
            take_profit: None,
            strategy_id: "test".to_string(),
        }
    }

    #[test]
    fn test_open_and_close() {
        let book = PositionBook::new();
        let pos = book
            .open(entry(OrderSide::Buy), Price::new(dec!(0.25)), Size::new(dec!(40)))
            .unwrap();
        assert_eq!(book.len(), 1);

        let closed = book.close(pos.id).unwrap();
        assert_eq!(closed.quantity, Size::new(dec!(40)));
        assert!(book.is_empty());
        assert!(book.close(pos.id).is_none());
    }

    #[test]
    fn test_open_rejects_zero_quantity() {
        let book = PositionBook::new();
        let err = book
            .open(entry(OrderSide::Buy), Price::new(dec!(0.25)), Size::ZERO)
            .unwrap_err();
        assert!(matches!(err, PositionError::InvalidFill(_)));
        assert!(book.is_empty());
    }

    #[test]
    fn test_partial_fills_merge_at_vwap() {
        let book = PositionBook::new();
        let cloid = ClientOrderId::new();
        book.track_entry(cloid.clone(), entry(OrderSide::Buy));

        let first = book
            .on_entry_fill(&cloid, Price::new(dec!(0.20)), Size::new(dec!(10)))
            .unwrap()
            .unwrap();
        let merged = book
            .on_entry_fill(&cloid, Price::new(dec!(0.30)), Size::new(dec!(30)))
            .unwrap()
            .unwrap();

        assert_eq!(first.id, merged.id);
        assert_eq!(merged.quantity, Size::new(dec!(40)));
        assert_eq!(merged.entry_price, Price::new(dec!(0.275)));
        assert_eq!(book.len(), 1);

        // partially filled: the reservation stays with the position
        assert_eq!(book.cancel_entry(&cloid), None);
        assert!(!book.is_entry(&cloid));
    }

    #[test]
    fn test_unfilled_cancel_returns_reservation() {
        let book = PositionBook::new();
        let cloid = ClientOrderId::new();
        let pending = entry(OrderSide::Sell);
        let reservation = pending.reservation;
        book.track_entry(cloid.clone(), pending);

        assert_eq!(book.resting_entries(), vec![cloid.clone()]);
        assert_eq!(book.cancel_entry(&cloid), Some(reservation));
        assert_eq!(book.cancel_entry(&cloid), None);
    }

    #[test]
    fn test_unknown_fill_ignored() {
        let book = PositionBook::new();
        let res = book
            .on_entry_fill(&ClientOrderId::new(), Price::new(dec!(1)), Size::new(dec!(1)))
            .unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn test_single_closing_order_per_position() {
        let book = PositionBook::new();
        let pos = book
            .open(entry(OrderSide::Buy), Price::new(dec!(0.25)), Size::new(dec!(40)))
            .unwrap();

        let first = ClientOrderId::new();
        book.begin_close(pos.id, first.clone()).unwrap();
        assert!(book.is_closing(pos.id));
        assert_eq!(book.closing_position(&first), Some(pos.id));
        assert!(matches!(
            book.begin_close(pos.id, ClientOrderId::new()),
            Err(PositionError::AlreadyClosing(_))
        ));

        book.abort_close(pos.id);
        assert!(!book.is_closing(pos.id));
        assert!(book.closing_position(&first).is_none());
        book.begin_close(pos.id, ClientOrderId::new()).unwrap();
    }

    #[test]
    fn test_begin_close_unknown_position() {
        let book = PositionBook::new();
        assert!(matches!(
            book.begin_close(PositionId::new(), ClientOrderId::new()),
            Err(PositionError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_by_reservation() {
        let book = PositionBook::new();
        let keep = book
            .open(entry(OrderSide::Buy), Price::new(dec!(1)), Size::new(dec!(1)))
            .unwrap();
        let gone = book
            .open(entry(OrderSide::Buy), Price::new(dec!(1)), Size::new(dec!(2)))
            .unwrap();

        let removed = book.remove_by_reservation(&[gone.reservation]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, gone.id);
        assert!(book.get(keep.id).is_some());
        assert!(book.remove_by_reservation(&[]).is_empty());
    }
}
