//! Latest quote per instrument.
//!
//! Written by the stream dispatcher, read by the strategy and exit loops.
//! Ages are tracked on the monotonic clock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sentinel_core::{InstrumentId, Price, Quote};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct MarketStateEntry {
    quote: Quote,
    recv_mono: Instant,
    updates: u64,
}

/// Point-in-time copy of the quote cache handed to strategies.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    quotes: HashMap<InstrumentId, Quote>,
    taken_at: Option<DateTime<Utc>>,
}

impl MarketSnapshot {
    pub fn new(quotes: HashMap<InstrumentId, Quote>) -> Self {
        Self {
            quotes,
            taken_at: Some(Utc::now()),
        }
    }

    pub fn get(&self, instrument: &InstrumentId) -> Option<&Quote> {
        self.quotes.get(instrument)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InstrumentId, &Quote)> {
        self.quotes.iter()
    }

    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        self.taken_at
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

/// Aggregated market state manager.
#[derive(Debug, Default)]
pub struct MarketState {
    markets: DashMap<InstrumentId, MarketStateEntry>,
}

impl MarketState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_quote(&self, quote: Quote) {
        let now = Instant::now();
        let mut entry = self
            .markets
            .entry(quote.instrument.clone())
            .or_insert_with(|| MarketStateEntry {
                quote: quote.clone(),
                recv_mono: now,
                updates: 0,
            });
        entry.updates += 1;
        entry.recv_mono = now;
        trace!(instrument = %quote.instrument, updates = entry.updates, "Quote updated");
        entry.quote = quote;
    }

    pub fn get_quote(&self, instrument: &InstrumentId) -> Option<Quote> {
        self.markets.get(instrument).map(|e| e.quote.clone())
    }

    /// Age since the last update on the monotonic clock.
    pub fn quote_age(&self, instrument: &InstrumentId) -> Option<Duration> {
        self.markets
            .get(instrument)
            .map(|e| Instant::now().duration_since(e.recv_mono))
    }

    /// Mark price, only if the quote is younger than `max_age`.
    pub fn fresh_mark(&self, instrument: &InstrumentId, max_age: Duration) -> Option<Price> {
        let entry = self.markets.get(instrument)?;
        if Instant::now().duration_since(entry.recv_mono) > max_age {
            return None;
        }
        entry.quote.mark()
    }

    /// Copy of every quote younger than `max_age`.
    pub fn snapshot(&self, max_age: Duration) -> MarketSnapshot {
        let now = Instant::now();
        let quotes = self
            .markets
            .iter()
            .filter(|e| now.duration_since(e.recv_mono) <= max_age)
            .map(|e| (e.key().clone(), e.quote.clone()))
            .collect();
        MarketSnapshot::new(quotes)
    }

    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.markets.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}
