//! Order-submission boundary.
//!
//! Handles everything between a risk-approved order and the exchange:
//!
//! - [`NonceSource`]: strictly increasing request nonces
//! - [`OrderGateway`]: the external transport trait (REST or otherwise)
//! - [`OrderSubmitter`]: breaker-guarded submission with bounded transient
//!   retries and a single nonce resync
//! - [`PaperGateway`]: simulated exchange for dry runs
//! - [`MockGateway`]: scripted gateway for tests

pub mod error;
pub mod gateway;
pub mod nonce;
pub mod paper;
pub mod submitter;

pub use error::{ExecutorError, ExecutorResult};
pub use gateway::{
    AccountSnapshot, BoxFuture, DynOrderGateway, Fill, GatewayError, MockGateway, OrderAck,
    OrderGateway, OrderStatus,
};
pub use nonce::{Clock, NonceSource, SystemClock};
pub use paper::PaperGateway;
pub use submitter::{OrderSubmitter, SubmitterConfig};
