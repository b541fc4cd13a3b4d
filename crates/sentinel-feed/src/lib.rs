//! Market and account stream handling.
//!
//! Turns validated stream messages into typed events and keeps the latest
//! quote per instrument in a concurrent [`MarketState`] that the engine's
//! loops read snapshots from.

pub mod error;
pub mod market_state;
pub mod parser;

pub use error::{FeedError, FeedResult};
pub use market_state::{MarketSnapshot, MarketState};
pub use parser::{BalanceUpdate, ExecType, ExecutionEvent, MarketEvent, MessageParser};
