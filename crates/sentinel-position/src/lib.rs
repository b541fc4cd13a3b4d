//! Open positions and their exits.
//!
//! - [`PositionBook`]: positions opened by fills, plus entry orders still
//!   resting on the book and the closing orders in flight
//! - [`ExitRules`]: stop-loss / take-profit evaluation against a mark price

pub mod book;
pub mod error;
pub mod exit;

pub use book::{PendingEntry, PositionBook};
pub use error::{PositionError, PositionResult};
pub use exit::{pnl_pct, ExitReason, ExitRules};
