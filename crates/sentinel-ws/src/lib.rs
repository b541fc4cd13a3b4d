//! Streaming exchange sessions.
//!
//! Provides WebSocket connectivity with:
//! - Two-tier reconnection (fast retries, then capped exponential backoff with jitter)
//! - A rolling cap on connection attempts per window
//! - Circuit-breaker guarded connection attempts with an availability signal
//! - Subscription replay after reconnect and runtime subscribe/unsubscribe
//! - Watchdog-forced reconnect on silent connections
//! - Shape validation of inbound frames before dispatch

pub mod attempts;
pub mod auth;
pub mod backoff;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod subscription;

pub use attempts::AttemptWindow;
pub use auth::{AuthToken, AuthTokenSource, StaticTokenSource};
pub use backoff::{ReconnectPolicy, RetryTier};
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus, KRAKEN_PRIVATE_URL,
    KRAKEN_PUBLIC_URL,
};
pub use error::{WsError, WsResult};
pub use heartbeat::Watchdog;
pub use message::{
    parse_frame, AckResult, Channel, ChannelData, Frame, MalformedReason, MethodAck, Request,
    StreamMessage, UpdateKind,
};
pub use subscription::{ChannelSpec, SubscriptionSet};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
