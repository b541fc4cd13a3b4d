//! Application configuration.
//!
//! Loaded from a TOML file; every field has a default so a partial file
//! (or none of a section) is valid. Durations are given in milliseconds.

use crate::error::{AppError, AppResult};
use rust_decimal::Decimal;
use sentinel_core::{InstrumentId, Notional};
use sentinel_executor::SubmitterConfig;
use sentinel_position::ExitRules;
use sentinel_resilience::BreakerConfig;
use sentinel_risk::{ExposureScope, RiskConfig};
use sentinel_ws::{
    Channel, ChannelSpec, ConnectionConfig, ReconnectPolicy, KRAKEN_PRIVATE_URL,
    KRAKEN_PUBLIC_URL,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_ENV: &str = "SENTINEL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Breaker names as registered with the engine's registry.
pub const BREAKER_WS_PUBLIC: &str = "ws-public";
pub const BREAKER_WS_PRIVATE: &str = "ws-private";
pub const BREAKER_ORDERS: &str = "orders";
pub const BREAKER_ACCOUNT: &str = "account";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub breakers: BreakerSet,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub submitter: SubmitterSettings,
    #[serde(default)]
    pub exits: ExitRules,
    #[serde(default)]
    pub paper: PaperSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Risk ceilings, in quote currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: Decimal,
    #[serde(default)]
    pub exposure_scope: ExposureScope,
    /// Only consulted with `exposure_scope = "per_instrument"`.
    #[serde(default)]
    pub max_aggregate_exposure: Option<Decimal>,
    /// Ledger/account disagreement tolerated before drift is reported.
    #[serde(default = "default_reconcile_tolerance")]
    pub reconcile_tolerance: Decimal,
    /// Below this balance new entries stop and open positions are closed.
    #[serde(default = "default_min_balance_required")]
    pub min_balance_required: Decimal,
    /// Below this balance every reconciliation logs a warning.
    #[serde(default = "default_min_balance_alert")]
    pub min_balance_alert: Decimal,
    /// Asset whose balance the minimums apply to. The exchange's legacy
    /// `Z`-prefixed code is accepted as well.
    #[serde(default = "default_balance_asset")]
    pub balance_asset: String,
}

fn default_max_position_size() -> Decimal {
    Decimal::from(10)
}

fn default_max_total_exposure() -> Decimal {
    Decimal::from(10)
}

fn default_reconcile_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

fn default_min_balance_required() -> Decimal {
    Decimal::from(15)
}

fn default_min_balance_alert() -> Decimal {
    Decimal::from(50)
}

fn default_balance_asset() -> String {
    "USD".to_string()
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position_size(),
            max_total_exposure: default_max_total_exposure(),
            exposure_scope: ExposureScope::default(),
            max_aggregate_exposure: None,
            reconcile_tolerance: default_reconcile_tolerance(),
            min_balance_required: default_min_balance_required(),
            min_balance_alert: default_min_balance_alert(),
            balance_asset: default_balance_asset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default = "default_private_url")]
    pub private_url: String,
    /// Run the authenticated session (requires a token source).
    #[serde(default = "default_true")]
    pub private_enabled: bool,
    /// Symbols whose ticker channel is subscribed.
    #[serde(default = "default_instruments")]
    pub instruments: Vec<String>,
    #[serde(default = "default_fast_retry_count")]
    pub fast_retry_count: u32,
    #[serde(default = "default_fast_retry_delay_ms")]
    pub fast_retry_delay_ms: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,
    /// 0 = retry forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    /// Connection attempts allowed per rolling window (0 = unlimited).
    #[serde(default = "default_connect_attempt_limit")]
    pub connect_attempt_limit: u32,
    #[serde(default = "default_connect_attempt_window_ms")]
    pub connect_attempt_window_ms: u64,
}

fn default_public_url() -> String {
    KRAKEN_PUBLIC_URL.to_string()
}

fn default_private_url() -> String {
    KRAKEN_PRIVATE_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_instruments() -> Vec<String> {
    vec!["XLM/USD".to_string()]
}

fn default_fast_retry_count() -> u32 {
    3
}

fn default_fast_retry_delay_ms() -> u64 {
    500
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_watchdog_timeout_ms() -> u64 {
    30_000
}

fn default_connect_attempt_limit() -> u32 {
    150
}

fn default_connect_attempt_window_ms() -> u64 {
    600_000
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            public_url: default_public_url(),
            private_url: default_private_url(),
            private_enabled: true,
            instruments: default_instruments(),
            fast_retry_count: default_fast_retry_count(),
            fast_retry_delay_ms: default_fast_retry_delay_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
            max_reconnect_attempts: 0,
            connect_attempt_limit: default_connect_attempt_limit(),
            connect_attempt_window_ms: default_connect_attempt_window_ms(),
        }
    }
}

/// Settings of one circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    60_000
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            call_timeout_ms: None,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            call_timeout: self.call_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// One breaker per guarded operation family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSet {
    #[serde(default = "default_connection_breaker")]
    pub ws_public: BreakerSettings,
    #[serde(default = "default_connection_breaker")]
    pub ws_private: BreakerSettings,
    #[serde(default = "default_orders_breaker")]
    pub orders: BreakerSettings,
    #[serde(default = "default_account_breaker")]
    pub account: BreakerSettings,
}

fn default_connection_breaker() -> BreakerSettings {
    BreakerSettings {
        failure_threshold: 8,
        open_timeout_ms: 60_000,
        call_timeout_ms: None,
    }
}

fn default_orders_breaker() -> BreakerSettings {
    BreakerSettings {
        failure_threshold: 5,
        open_timeout_ms: 30_000,
        call_timeout_ms: Some(10_000),
    }
}

fn default_account_breaker() -> BreakerSettings {
    BreakerSettings {
        failure_threshold: 3,
        open_timeout_ms: 60_000,
        call_timeout_ms: Some(10_000),
    }
}

impl Default for BreakerSet {
    fn default() -> Self {
        Self {
            ws_public: default_connection_breaker(),
            ws_private: default_connection_breaker(),
            orders: default_orders_breaker(),
            account: default_account_breaker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_evaluation_interval_ms")]
    pub evaluation_interval_ms: u64,
    #[serde(default = "default_exit_check_interval_ms")]
    pub exit_check_interval_ms: u64,
    #[serde(default = "default_reconciliation_interval_ms")]
    pub reconciliation_interval_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Consecutive health checks a breaker may stay open before the
    /// kill-switch fires.
    #[serde(default = "default_emergency_open_checks")]
    pub emergency_open_checks: u32,
    #[serde(default = "default_reservation_leak_age_ms")]
    pub reservation_leak_age_ms: u64,
    /// Quotes older than this are not handed to strategies or exits.
    #[serde(default = "default_quote_max_age_ms")]
    pub quote_max_age_ms: u64,
    /// Capacity of the stream-to-dispatcher channel.
    #[serde(default = "default_message_buffer")]
    pub message_buffer: usize,
}

fn default_evaluation_interval_ms() -> u64 {
    1_000
}

fn default_exit_check_interval_ms() -> u64 {
    500
}

fn default_reconciliation_interval_ms() -> u64 {
    60_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_health_check_interval_ms() -> u64 {
    5_000
}

fn default_emergency_open_checks() -> u32 {
    12
}

fn default_reservation_leak_age_ms() -> u64 {
    300_000
}

fn default_quote_max_age_ms() -> u64 {
    10_000
}

fn default_message_buffer() -> usize {
    1_024
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: default_evaluation_interval_ms(),
            exit_check_interval_ms: default_exit_check_interval_ms(),
            reconciliation_interval_ms: default_reconciliation_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            emergency_open_checks: default_emergency_open_checks(),
            reservation_leak_age_ms: default_reservation_leak_age_ms(),
            quote_max_age_ms: default_quote_max_age_ms(),
            message_buffer: default_message_buffer(),
        }
    }
}

impl EngineSettings {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn exit_check_interval(&self) -> Duration {
        Duration::from_millis(self.exit_check_interval_ms)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.reconciliation_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn reservation_leak_age(&self) -> Duration {
        Duration::from_millis(self.reservation_leak_age_ms)
    }

    pub fn quote_max_age(&self) -> Duration {
        Duration::from_millis(self.quote_max_age_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitterSettings {
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_transient_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    200
}

impl Default for SubmitterSettings {
    fn default() -> Self {
        Self {
            transient_retries: default_transient_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperSettings {
    #[serde(default = "default_starting_balance")]
    pub starting_balance: Decimal,
}

fn default_starting_balance() -> Decimal {
    Decimal::from(1_000)
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            starting_balance: default_starting_balance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default log filter; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Config path: explicit argument, then `SENTINEL_CONFIG`, then the
    /// bundled default.
    pub fn resolve_path(cli: Option<String>) -> String {
        cli.or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        let risk = &self.risk;
        if risk.max_position_size <= Decimal::ZERO || risk.max_total_exposure <= Decimal::ZERO {
            return Err(AppError::Config(
                "risk ceilings must be positive".to_string(),
            ));
        }
        if risk.min_balance_required < Decimal::ZERO
            || risk.min_balance_alert < risk.min_balance_required
        {
            return Err(AppError::Config(format!(
                "risk.min_balance_alert ({}) must be at least min_balance_required ({}) and both non-negative",
                risk.min_balance_alert, risk.min_balance_required
            )));
        }
        if self.connection.connect_attempt_limit > 0
            && self.connection.connect_attempt_window_ms == 0
        {
            return Err(AppError::Config(
                "connection.connect_attempt_window_ms must be positive when a limit is set"
                    .to_string(),
            ));
        }
        for raw in &self.connection.instruments {
            InstrumentId::from_str(raw)
                .map_err(|e| AppError::Config(format!("connection.instruments: {e}")))?;
        }
        for (name, breaker) in [
            (BREAKER_WS_PUBLIC, &self.breakers.ws_public),
            (BREAKER_WS_PRIVATE, &self.breakers.ws_private),
        ] {
            if breaker.failure_threshold <= self.connection.fast_retry_count {
                return Err(AppError::Config(format!(
                    "breaker {name}: failure_threshold ({}) must exceed fast_retry_count ({})",
                    breaker.failure_threshold, self.connection.fast_retry_count
                )));
            }
        }
        for (name, breaker) in [
            (BREAKER_ORDERS, &self.breakers.orders),
            (BREAKER_ACCOUNT, &self.breakers.account),
        ] {
            if breaker.failure_threshold == 0 {
                return Err(AppError::Config(format!(
                    "breaker {name}: failure_threshold must be at least 1"
                )));
            }
        }
        if self.engine.emergency_open_checks == 0 {
            return Err(AppError::Config(
                "engine.emergency_open_checks must be at least 1".to_string(),
            ));
        }
        if self.engine.message_buffer == 0 {
            return Err(AppError::Config(
                "engine.message_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            max_position_size: Notional::new(self.risk.max_position_size),
            max_total_exposure: Notional::new(self.risk.max_total_exposure),
            exposure_scope: self.risk.exposure_scope,
            max_aggregate_exposure: self.risk.max_aggregate_exposure.map(Notional::new),
        }
    }

    pub fn submitter_config(&self) -> SubmitterConfig {
        SubmitterConfig {
            transient_retries: self.submitter.transient_retries,
            retry_delay: Duration::from_millis(self.submitter.retry_delay_ms),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let c = &self.connection;
        ReconnectPolicy {
            fast_retry_count: c.fast_retry_count,
            fast_retry_delay: Duration::from_millis(c.fast_retry_delay_ms),
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            attempt_limit: c.connect_attempt_limit,
            attempt_window: Duration::from_millis(c.connect_attempt_window_ms),
            ..ReconnectPolicy::default()
        }
    }

    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.connection
            .instruments
            .iter()
            .filter_map(|s| InstrumentId::from_str(s).ok())
            .collect()
    }

    /// Public market-data session: ticker for every configured instrument.
    pub fn public_connection(&self) -> ConnectionConfig {
        self.session(
            "public",
            &self.connection.public_url,
            vec![ChannelSpec::public(
                Channel::Ticker,
                self.connection.instruments.iter().cloned(),
            )],
        )
    }

    /// Authenticated session: order executions and balances.
    pub fn private_connection(&self) -> ConnectionConfig {
        self.session(
            "private",
            &self.connection.private_url,
            vec![
                ChannelSpec::private(Channel::Executions),
                ChannelSpec::private(Channel::Balances),
            ],
        )
    }

    fn session(&self, name: &str, url: &str, subscriptions: Vec<ChannelSpec>) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_string(),
            url: url.to_string(),
            subscriptions,
            reconnect: self.reconnect_policy(),
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            watchdog_timeout: Duration::from_millis(self.connection.watchdog_timeout_ms),
            max_reconnect_attempts: self.connection.max_reconnect_attempts,
        }
    }
}
