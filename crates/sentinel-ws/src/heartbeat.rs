//! Liveness tracking for a streaming session.
//!
//! Any inbound traffic (data, server heartbeats, pongs, protocol pings)
//! feeds the watchdog. After half the timeout of silence the session
//! sends an application ping; after the full timeout it is declared dead
//! and torn down for reconnection.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    last_traffic: Instant,
    ping_sent_at: Option<Instant>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_traffic: Instant::now(),
            ping_sent_at: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How often the session should evaluate the watchdog.
    pub fn check_interval(&self) -> Duration {
        (self.timeout / 4).max(MIN_CHECK_INTERVAL)
    }

    pub fn record_traffic(&mut self) {
        let now = Instant::now();
        if let Some(sent) = self.ping_sent_at.take() {
            debug!(rtt_ms = now.duration_since(sent).as_millis() as u64, "Traffic after ping");
        }
        self.last_traffic = now;
    }

    pub fn record_ping(&mut self) {
        self.ping_sent_at = Some(Instant::now());
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().duration_since(self.last_traffic)
    }

    pub fn is_expired(&self) -> bool {
        self.idle_for() >= self.timeout
    }

    /// Idle long enough to ping, and no ping outstanding.
    pub fn should_ping(&self) -> bool {
        self.ping_sent_at.is_none() && self.idle_for() >= self.timeout / 2
    }
}
