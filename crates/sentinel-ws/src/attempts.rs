//! Rolling cap on connection attempts.
//!
//! Exchanges limit how often a client may open connections (Kraken:
//! 150 per 10 minutes). A server that accepts and immediately drops the
//! socket never trips the breaker, so the reconnect loop checks this
//! window before every attempt.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct AttemptWindow {
    /// 0 disables the cap.
    limit: u32,
    window: Duration,
    attempts: VecDeque<Instant>,
}

impl AttemptWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            attempts: VecDeque::with_capacity(limit as usize),
        }
    }

    /// How long until another attempt is allowed; `None` if one is allowed
    /// now.
    pub fn wait_time(&mut self, now: Instant) -> Option<Duration> {
        if self.limit == 0 {
            return None;
        }
        self.prune(now);
        if self.attempts.len() < self.limit as usize {
            return None;
        }
        self.attempts
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .filter(|wait| !wait.is_zero())
    }

    pub fn record(&mut self, now: Instant) {
        if self.limit == 0 {
            return;
        }
        self.prune(now);
        self.attempts.push_back(now);
    }

    /// Attempts inside the current window.
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while self
            .attempts
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            self.attempts.pop_front();
        }
    }
}
