//! Market data snapshot types.

use crate::{InstrumentId, Price};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Top-of-book plus last trade for one instrument, as delivered by the
/// ticker channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: InstrumentId,
    pub bid: Price,
    pub ask: Price,
    pub last: Price,
    /// Timestamp when this quote was received.
    pub received_at: DateTime<Utc>,
}

impl Quote {
    pub fn new(instrument: InstrumentId, bid: Price, ask: Price, last: Price) -> Self {
        Self {
            instrument,
            bid,
            ask,
            last,
            received_at: Utc::now(),
        }
    }

    /// Both sides present and not crossed.
    pub fn is_valid(&self) -> bool {
        self.bid.is_positive() && self.ask.is_positive() && self.bid < self.ask
    }

    /// Mid price, `None` when the book is one-sided or crossed.
    pub fn mid(&self) -> Option<Price> {
        if !self.is_valid() {
            return None;
        }
        Some(Price::new((self.bid.inner() + self.ask.inner()) / Decimal::TWO))
    }

    /// Best available mark: mid when the book is sane, otherwise last trade.
    pub fn mark(&self) -> Option<Price> {
        self.mid()
            .or_else(|| self.last.is_positive().then_some(self.last))
    }

    /// Age of this quote in milliseconds.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.received_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mid_and_mark() {
        let q = Quote::new(
            InstrumentId::new("XLM/USD"),
            Price::new(dec!(0.24)),
            Price::new(dec!(0.26)),
            Price::new(dec!(0.25)),
        );
        assert_eq!(q.mid(), Some(Price::new(dec!(0.25))));
        assert_eq!(q.mark(), Some(Price::new(dec!(0.25))));
    }

    #[test]
    fn test_crossed_book_falls_back_to_last() {
        let q = Quote::new(
            InstrumentId::new("XLM/USD"),
            Price::new(dec!(0.27)),
            Price::new(dec!(0.26)),
            Price::new(dec!(0.265)),
        );
        assert!(!q.is_valid());
        assert_eq!(q.mid(), None);
        assert_eq!(q.mark(), Some(Price::new(dec!(0.265))));
    }
}
