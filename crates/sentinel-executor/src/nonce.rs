//! Strictly increasing nonces for authenticated requests.
//!
//! Every private request carries a nonce the exchange requires to be
//! greater than the last one it saw for the key. Nonces derive from the
//! wall clock at nanosecond resolution; when the clock has not advanced
//! (or has gone backwards) the source issues `last + 1` instead.
//!
//! A clock that stays frozen makes nonces drift ahead of real time one
//! unit per call. That is detected and reported but never corrected here:
//! the operator has to fix the host clock.

use parking_lot::Mutex;
use sentinel_telemetry::Metrics;
use std::sync::Arc;
use tracing::{info, warn};

/// Trait for obtaining current time, enabling testability.
pub trait Clock: Send + Sync {
    /// Returns current time in nanoseconds since Unix epoch.
    fn now_nanos(&self) -> u64;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        // A pre-epoch clock reads as 0; the last+1 rule keeps nonces valid.
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct NonceState {
    last_issued: u64,
    last_reading: u64,
    frozen_streak: u32,
    clock_suspect: bool,
}

/// Issues unique, strictly increasing nonces to any number of concurrent
/// callers. Never fails.
pub struct NonceSource {
    state: Mutex<NonceState>,
    clock: Arc<dyn Clock>,
}

impl NonceSource {
    /// Consecutive identical clock readings before the clock is reported frozen.
    const FROZEN_READINGS_WARN: u32 = 10_000;
    /// Backwards jump (1s) reported as a clock regression.
    const REGRESSION_WARN_NANOS: u64 = 1_000_000_000;

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(NonceState::default()),
            clock,
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Next nonce: the current clock reading, or `last + 1` when the
    /// reading would not be strictly greater than the last issued value.
    pub fn next(&self) -> u64 {
        let mut state = self.state.lock();
        let reading = self.clock.now_nanos();
        self.observe_reading(&mut state, reading);

        let nonce = if reading > state.last_issued {
            reading
        } else {
            Metrics::nonce_bumped();
            state.last_issued.saturating_add(1)
        };
        state.last_issued = nonce;
        nonce
    }

    /// Last value handed out (0 before the first call).
    pub fn last_issued(&self) -> u64 {
        self.state.lock().last_issued
    }

    /// Raise the floor so the next nonce is greater than `min`, e.g. when
    /// the exchange reports the value it expects to be exceeded.
    pub fn fast_forward(&self, min: u64) {
        let mut state = self.state.lock();
        if state.last_issued < min {
            info!(from = state.last_issued, to = min, "Nonce floor fast-forwarded");
            state.last_issued = min;
        }
    }

    /// True while the clock looks frozen or regressed.
    pub fn clock_suspect(&self) -> bool {
        self.state.lock().clock_suspect
    }

    fn observe_reading(&self, state: &mut NonceState, reading: u64) {
        if reading == state.last_reading {
            state.frozen_streak = state.frozen_streak.saturating_add(1);
            if state.frozen_streak == Self::FROZEN_READINGS_WARN && !state.clock_suspect {
                state.clock_suspect = true;
                warn!(
                    kind = "clock_stall",
                    reading,
                    last_issued = state.last_issued,
                    "System clock has not advanced; nonces are drifting ahead of real time, \
                     operator must correct the host clock"
                );
            }
        } else {
            if state.last_reading.saturating_sub(reading) >= Self::REGRESSION_WARN_NANOS
                && !state.clock_suspect
            {
                state.clock_suspect = true;
                warn!(
                    kind = "clock_stall",
                    reading,
                    previous = state.last_reading,
                    "System clock moved backwards; issuing last+1 until it catches up"
                );
            } else if state.clock_suspect && reading > state.last_issued {
                state.clock_suspect = false;
                info!("System clock caught up with issued nonces");
            }
            state.frozen_streak = 0;
            state.last_reading = reading;
        }
    }
}

impl std::fmt::Debug for NonceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceSource")
            .field("last_issued", &self.last_issued())
            .finish()
    }
}
