//! Simulated exchange for dry runs.
//!
//! Market orders fill immediately at the order's reference price; every
//! other type rests until cancelled. Net positions are tracked per
//! instrument so reconciliation has a realistic account to compare with.

use crate::gateway::{
    AccountSnapshot, BoxFuture, Fill, GatewayError, OrderAck, OrderGateway, OrderStatus,
};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sentinel_core::{ClientOrderId, InstrumentId, Notional, OrderRequest, OrderType};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy)]
struct PaperPosition {
    /// Signed base quantity.
    quantity: Decimal,
    /// Volume-weighted entry price of the open quantity.
    entry_price: Decimal,
}

#[derive(Debug, Default)]
struct PaperBook {
    positions: HashMap<InstrumentId, PaperPosition>,
    resting: Vec<OrderRequest>,
    quote_balance: Decimal,
}

#[derive(Debug, Default)]
pub struct PaperGateway {
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                quote_balance: starting_balance,
                ..PaperBook::default()
            }),
        }
    }

    pub fn resting_orders(&self) -> usize {
        self.book.lock().resting.len()
    }

    fn execute(&self, order: &OrderRequest) -> Result<OrderStatus, GatewayError> {
        if !order.size.is_positive() {
            return Err(GatewayError::Rejected("size must be positive".to_string()));
        }
        let price = match order.price {
            Some(p) if p.is_positive() => p,
            _ => {
                return Err(GatewayError::Rejected(
                    "paper fills need a price".to_string(),
                ))
            }
        };

        let mut book = self.book.lock();
        if order.order_type != OrderType::Market {
            book.resting.push(order.clone());
            return Ok(OrderStatus::Resting);
        }

        let signed = order.size.inner() * Decimal::from(order.side.sign());
        if order.reduce_only {
            let held = book
                .positions
                .get(&order.instrument)
                .map(|p| p.quantity)
                .unwrap_or(Decimal::ZERO);
            let reduces =
                !held.is_zero() && held.is_sign_positive() != signed.is_sign_positive();
            if !reduces || signed.abs() > held.abs() {
                return Err(GatewayError::Rejected(
                    "reduce-only order would increase position".to_string(),
                ));
            }
        }

        let pos = book.positions.entry(order.instrument.clone()).or_default();
        let same_direction =
            pos.quantity.is_zero() || pos.quantity.is_sign_positive() == signed.is_sign_positive();
        if same_direction {
            let new_qty = pos.quantity + signed;
            pos.entry_price = (pos.entry_price * pos.quantity.abs() + price.inner() * signed.abs())
                / new_qty.abs();
            pos.quantity = new_qty;
        } else {
            pos.quantity += signed;
            if pos.quantity.is_zero() {
                pos.entry_price = Decimal::ZERO;
            }
        }
        let flat = pos.quantity.is_zero();
        if flat {
            book.positions.remove(&order.instrument);
        }
        book.quote_balance -= signed * price.inner();

        Ok(OrderStatus::Filled(Fill {
            price,
            quantity: order.size,
        }))
    }
}

impl OrderGateway for PaperGateway {
    fn submit<'a>(
        &'a self,
        order: &'a OrderRequest,
        _nonce: u64,
    ) -> BoxFuture<'a, Result<OrderAck, GatewayError>> {
        Box::pin(async move {
            let status = self.execute(order)?;
            Ok(OrderAck {
                client_order_id: order.client_order_id.clone(),
                exchange_order_id: format!(
                    "PAPER-{}",
                    &Uuid::new_v4().simple().to_string()[..10]
                ),
                status,
            })
        })
    }

    fn cancel_all(&self, _nonce: u64) -> BoxFuture<'_, Result<Vec<ClientOrderId>, GatewayError>> {
        Box::pin(async move {
            let cancelled: Vec<ClientOrderId> = self
                .book
                .lock()
                .resting
                .drain(..)
                .map(|o| o.client_order_id)
                .collect();
            info!(count = cancelled.len(), "Paper orders cancelled");
            Ok(cancelled)
        })
    }

    fn account_snapshot(&self, _nonce: u64) -> BoxFuture<'_, Result<AccountSnapshot, GatewayError>> {
        Box::pin(async move {
            let book = self.book.lock();
            let exposures = book
                .positions
                .iter()
                .map(|(instrument, pos)| {
                    (
                        instrument.clone(),
                        Notional::new(pos.quantity.abs() * pos.entry_price),
                    )
                })
                .collect();
            let mut balances = HashMap::new();
            balances.insert("USD".to_string(), book.quote_balance);
            Ok(AccountSnapshot {
                exposures,
                balances,
                as_of: Some(Utc::now()),
            })
        })
    }
}
