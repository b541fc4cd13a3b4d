//! Prometheus metrics for sentinel.
//!
//! Covers connection sessions, circuit breakers, risk decisions, the
//! exposure ledger, nonce issuance and engine lifecycle.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_counter, register_int_gauge, CounterVec, Encoder, Gauge, GaugeVec,
    HistogramVec, IntCounter, IntGauge, TextEncoder,
};
use std::path::Path;

// =========================================================================
// Connection sessions
// =========================================================================

/// Session state machine. Labels: session, state.
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "sentinel_ws_state",
        "Connection state machine current state (1=active, 0=inactive)",
        &["session", "state"]
    )
    .unwrap()
});

/// Reconnect attempts. Labels: session, tier (fast/backoff).
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_ws_reconnect_total",
        "Total reconnection attempts",
        &["session", "tier"]
    )
    .unwrap()
});

/// Inbound frames dropped before dispatch. Labels: session, reason.
pub static WS_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_ws_dropped_total",
        "Inbound frames dropped (malformed or unknown discriminator)",
        &["session", "reason"]
    )
    .unwrap()
});

/// Session unavailable because its connection breaker is open.
pub static WS_UNAVAILABLE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "sentinel_ws_unavailable",
        "Connection unavailable (1=breaker open)",
        &["session"]
    )
    .unwrap()
});

// =========================================================================
// Circuit breakers
// =========================================================================

/// Breaker state: 0=closed, 1=half-open, 2=open.
pub static BREAKER_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "sentinel_breaker_state",
        "Circuit breaker state (0=closed, 1=half_open, 2=open)",
        &["breaker"]
    )
    .unwrap()
});

pub static BREAKER_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_breaker_rejected_total",
        "Calls short-circuited by an open breaker",
        &["breaker"]
    )
    .unwrap()
});

// =========================================================================
// Risk and exposure
// =========================================================================

pub static RISK_DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_risk_decisions_total",
        "Risk gate decisions",
        &["decision"]
    )
    .unwrap()
});

pub static LEDGER_EXPOSURE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "sentinel_ledger_exposure",
        "Committed notional across all reservations"
    )
    .unwrap()
});

pub static LEDGER_RESERVATIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sentinel_ledger_reservations",
        "Live exposure reservations"
    )
    .unwrap()
});

pub static LEDGER_ANOMALIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_ledger_anomalies_total",
        "Ledger bookkeeping anomalies (double release, leak, drift)",
        &["anomaly"]
    )
    .unwrap()
});

// =========================================================================
// Order submission
// =========================================================================

pub static NONCE_BUMPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sentinel_nonce_bumps_total",
        "Nonces issued as last+1 because the clock did not advance"
    )
    .unwrap()
});

pub static ORDERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_orders_total",
        "Orders handed to the submission boundary",
        &["result"]
    )
    .unwrap()
});

pub static POSITIONS_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("sentinel_positions_open", "Open positions").unwrap()
});

pub static TRADE_PNL: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sentinel_trade_pnl_pct",
        "Realized trade PnL in percent of entry notional",
        &["instrument", "exit_reason"],
        vec![-10.0, -5.0, -2.0, -1.0, -0.5, 0.0, 0.5, 1.0, 2.0, 5.0, 10.0]
    )
    .unwrap()
});

// =========================================================================
// Engine
// =========================================================================

pub static ENGINE_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "sentinel_engine_state",
        "Engine lifecycle state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

pub static EMERGENCY_STOPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sentinel_emergency_stops_total",
        "Kill-switch activations"
    )
    .unwrap()
});

pub static LOOP_ITERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sentinel_loop_iterations_total",
        "Engine loop iterations",
        &["task"]
    )
    .unwrap()
});

const WS_STATES: [&str; 4] = ["disconnected", "connecting", "connected", "reconnecting"];
const ENGINE_STATES: [&str; 4] = ["stopped", "starting", "running", "stopping"];

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Set the active session state; all others go to 0.
    pub fn ws_state_set(session: &str, state: &str) {
        for s in WS_STATES {
            WS_STATE.with_label_values(&[session, s]).set(0.0);
        }
        WS_STATE.with_label_values(&[session, state]).set(1.0);
    }

    pub fn ws_reconnect(session: &str, tier: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[session, tier]).inc();
    }

    pub fn ws_dropped(session: &str, reason: &str) {
        WS_DROPPED_TOTAL.with_label_values(&[session, reason]).inc();
    }

    pub fn ws_unavailable(session: &str, unavailable: bool) {
        WS_UNAVAILABLE
            .with_label_values(&[session])
            .set(if unavailable { 1.0 } else { 0.0 });
    }

    pub fn breaker_state(breaker: &str, code: f64) {
        BREAKER_STATE.with_label_values(&[breaker]).set(code);
    }

    pub fn breaker_rejected(breaker: &str) {
        BREAKER_REJECTED_TOTAL.with_label_values(&[breaker]).inc();
    }

    pub fn risk_decision(decision: &str) {
        RISK_DECISIONS_TOTAL.with_label_values(&[decision]).inc();
    }

    pub fn ledger_levels(exposure: f64, reservations: i64) {
        LEDGER_EXPOSURE.set(exposure);
        LEDGER_RESERVATIONS.set(reservations);
    }

    pub fn ledger_anomaly(anomaly: &str) {
        LEDGER_ANOMALIES_TOTAL.with_label_values(&[anomaly]).inc();
    }

    pub fn nonce_bumped() {
        NONCE_BUMPS_TOTAL.inc();
    }

    pub fn order_result(result: &str) {
        ORDERS_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn positions_open(count: i64) {
        POSITIONS_OPEN.set(count);
    }

    pub fn trade_pnl(instrument: &str, exit_reason: &str, pnl_pct: f64) {
        TRADE_PNL
            .with_label_values(&[instrument, exit_reason])
            .observe(pnl_pct);
    }

    pub fn engine_state_set(state: &str) {
        for s in ENGINE_STATES {
            ENGINE_STATE.with_label_values(&[s]).set(0.0);
        }
        ENGINE_STATE.with_label_values(&[state]).set(1.0);
    }

    pub fn emergency_stop() {
        EMERGENCY_STOPS_TOTAL.inc();
    }

    pub fn loop_iteration(task: &str) {
        LOOP_ITERATIONS_TOTAL.with_label_values(&[task]).inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn gather_text() -> TelemetryResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Write the current values to `path` in the text format, for the
    /// node exporter's textfile collector or a post-run inspection.
    pub fn dump_to(path: impl AsRef<Path>) -> TelemetryResult<()> {
        let path = path.as_ref();
        let text = Self::gather_text()?;
        std::fs::write(path, text).map_err(|source| TelemetryError::Dump {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_state_set_is_exclusive() {
        Metrics::ws_state_set("test-session", "connecting");
        Metrics::ws_state_set("test-session", "connected");
        assert_eq!(
            WS_STATE
                .with_label_values(&["test-session", "connected"])
                .get(),
            1.0
        );
        assert_eq!(
            WS_STATE
                .with_label_values(&["test-session", "connecting"])
                .get(),
            0.0
        );
    }

    #[test]
    fn test_gather_text_contains_registered_metric() {
        Metrics::breaker_rejected("test-breaker");
        let text = Metrics::gather_text().unwrap();
        assert!(text.contains("sentinel_breaker_rejected_total"));
    }

    #[test]
    fn test_dump_writes_text_format() {
        Metrics::loop_iteration("dump-test");
        let path = std::env::temp_dir().join(format!("sentinel-metrics-{}.prom", std::process::id()));

        Metrics::dump_to(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(written.contains("sentinel_loop_iterations_total"));
        assert!(written.contains("dump-test"));
    }

    #[test]
    fn test_dump_to_missing_directory_names_path() {
        let path = std::env::temp_dir()
            .join(format!("sentinel-missing-{}", std::process::id()))
            .join("metrics.prom");
        match Metrics::dump_to(&path) {
            Err(TelemetryError::Dump { path: failed, .. }) => assert_eq!(failed, path),
            other => panic!("unexpected {other:?}"),
        }
    }
}
