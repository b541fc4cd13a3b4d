//! Pluggable signal producers.
//!
//! The engine owns no trading logic of its own: each evaluation tick it
//! hands every registered strategy a snapshot of fresh quotes and collects
//! the signals they propose. Everything a strategy returns still has to
//! clear the risk gate.

use futures_util::future::BoxFuture;
use sentinel_core::Signal;
use sentinel_feed::MarketSnapshot;

pub trait Strategy: Send + Sync {
    /// Stable identifier, carried on every signal for attribution.
    fn id(&self) -> &str;

    /// Propose signals for the current market. An empty vector means
    /// "nothing to do this tick".
    fn evaluate<'a>(&'a self, market: &'a MarketSnapshot) -> BoxFuture<'a, Vec<Signal>>;
}
