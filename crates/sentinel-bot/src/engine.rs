//! Engine lifecycle and task orchestration.
//!
//! The engine owns every long-running task of a trading session:
//!
//! - one [`ConnectionManager`] per streaming session (public market data,
//!   optional private executions/balances)
//! - a dispatcher turning stream messages into market and order state
//! - the evaluation loop (strategies -> risk gate -> submitter)
//! - the exit loop (stop-loss / take-profit on open positions)
//! - the reconciliation loop (ledger vs. account snapshot, minimum
//!   balance protection)
//! - the health loop driving the breaker kill-switch
//!
//! All tasks share one [`CancellationToken`]. Stopping first suppresses new
//! signals and cancels resting orders, then cancels the token and waits for
//! every task up to the shutdown deadline. Tasks that miss it are aborted
//! and the stop is reported unclean.

use crate::config::{
    AppConfig, BREAKER_ACCOUNT, BREAKER_ORDERS, BREAKER_WS_PRIVATE, BREAKER_WS_PUBLIC,
};
use crate::error::{EngineError, EngineResult};
use crate::strategy::Strategy;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sentinel_core::{
    ClientOrderId, FaultKind, InstrumentId, Notional, OrderType, Position, PositionId, Price,
    Signal,
};
use sentinel_executor::{DynOrderGateway, NonceSource, OrderStatus, OrderSubmitter};
use sentinel_feed::{ExecType, ExecutionEvent, MarketEvent, MarketState, MessageParser};
use sentinel_position::{pnl_pct, ExitReason, PendingEntry, PositionBook};
use sentinel_resilience::{BreakerRegistry, CircuitBreaker};
use sentinel_risk::{EmergencyLatch, EmergencyReason, ExposureLedger, RiskGate};
use sentinel_telemetry::Metrics;
use sentinel_ws::{AuthTokenSource, ConnectionManager, ConnectionStatus, StreamMessage};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TASK_WS_PUBLIC: &str = "ws-public";
const TASK_WS_PRIVATE: &str = "ws-private";
const TASK_DISPATCHER: &str = "dispatcher";
const TASK_EVALUATION: &str = "evaluation";
const TASK_EXITS: &str = "exits";
const TASK_RECONCILIATION: &str = "reconciliation";
const TASK_HEALTH: &str = "health";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a supervised task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    /// Observed the shutdown token.
    Cancelled,
    /// Ended on its own with an error before shutdown.
    Failed(String),
}

/// Outcome of [`Engine::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every task finished before the deadline.
    pub clean: bool,
    /// Tasks aborted after missing the shutdown deadline.
    pub abandoned: Vec<String>,
    /// Tasks that had already failed or panicked.
    pub failed: Vec<String>,
    /// Resting orders the exchange confirmed cancelled.
    pub cancelled_orders: usize,
}

/// External collaborators injected at construction.
pub struct EngineComponents {
    pub gateway: DynOrderGateway,
    pub strategies: Vec<Arc<dyn Strategy>>,
    /// Required for the private session; without it only public data runs.
    pub token_source: Option<Arc<dyn AuthTokenSource>>,
}

struct RunHandle {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<TaskExit>)>,
    public: Arc<ConnectionManager>,
    private: Option<Arc<ConnectionManager>>,
}

struct EngineInner {
    config: AppConfig,
    state: watch::Sender<EngineState>,
    accepting_signals: AtomicBool,
    latch: Arc<EmergencyLatch>,
    registry: Arc<BreakerRegistry>,
    public_breaker: Arc<CircuitBreaker>,
    private_breaker: Arc<CircuitBreaker>,
    ledger: Arc<ExposureLedger>,
    gate: RiskGate,
    submitter: OrderSubmitter,
    positions: Arc<PositionBook>,
    market: Arc<MarketState>,
    parser: MessageParser,
    strategies: Vec<Arc<dyn Strategy>>,
    token_source: Option<Arc<dyn AuthTokenSource>>,
    exit_reasons: DashMap<PositionId, ExitReason>,
    run: Mutex<Option<RunHandle>>,
}

/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: AppConfig, components: EngineComponents) -> Self {
        let registry = Arc::new(BreakerRegistry::new());
        let breakers = &config.breakers;
        let public_breaker =
            registry.create(BREAKER_WS_PUBLIC, breakers.ws_public.to_breaker_config());
        let private_breaker =
            registry.create(BREAKER_WS_PRIVATE, breakers.ws_private.to_breaker_config());
        let orders_breaker = registry.create(BREAKER_ORDERS, breakers.orders.to_breaker_config());
        let account_breaker =
            registry.create(BREAKER_ACCOUNT, breakers.account.to_breaker_config());

        let ledger = Arc::new(ExposureLedger::new());
        let gate = RiskGate::new(config.risk_config(), Arc::clone(&ledger));
        let submitter = OrderSubmitter::new(
            components.gateway,
            Arc::new(NonceSource::with_system_clock()),
            orders_breaker,
            account_breaker,
            config.submitter_config(),
        );
        let (state, _) = watch::channel(EngineState::Stopped);

        Self {
            inner: Arc::new(EngineInner {
                config,
                state,
                accepting_signals: AtomicBool::new(false),
                latch: Arc::new(EmergencyLatch::new()),
                registry,
                public_breaker,
                private_breaker,
                ledger,
                gate,
                submitter,
                positions: Arc::new(PositionBook::new()),
                market: Arc::new(MarketState::new()),
                parser: MessageParser::default(),
                strategies: components.strategies,
                token_source: components.token_source,
                exit_reasons: DashMap::new(),
                run: Mutex::new(None),
            }),
        }
    }

    /// Start every session task. Must be called from within a Tokio runtime.
    ///
    /// Refused while the emergency latch is set or unless the engine is
    /// `STOPPED`.
    pub fn start(&self) -> EngineResult<()> {
        let inner = &self.inner;
        if let Some(reason) = inner.latch.reason() {
            error!(
                kind = FaultKind::Emergency.as_str(),
                reason = %reason,
                "Start refused: emergency latch is set"
            );
            return Err(EngineError::EmergencyLatched(reason.to_string()));
        }
        inner.transition(EngineState::Stopped, EngineState::Starting, "start")?;

        let config = &inner.config;
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.engine.message_buffer);

        let public = Arc::new(
            ConnectionManager::new(
                config.public_connection(),
                tx.clone(),
                Arc::clone(&inner.public_breaker),
            )
            .with_shutdown_token(token.child_token()),
        );
        let private = match (&inner.token_source, config.connection.private_enabled) {
            (Some(source), true) => Some(Arc::new(
                ConnectionManager::new(
                    config.private_connection(),
                    tx.clone(),
                    Arc::clone(&inner.private_breaker),
                )
                .with_token_source(Arc::clone(source))
                .with_shutdown_token(token.child_token()),
            )),
            (None, true) => {
                warn!("Private session enabled without a token source, running public data only");
                None
            }
            _ => None,
        };
        drop(tx);

        let mut tasks = vec![(TASK_WS_PUBLIC, spawn_session(Arc::clone(&public)))];
        if let Some(private) = &private {
            tasks.push((TASK_WS_PRIVATE, spawn_session(Arc::clone(private))));
        }
        tasks.push((
            TASK_DISPATCHER,
            tokio::spawn(dispatch_loop(Arc::clone(inner), rx, token.clone())),
        ));
        tasks.push((
            TASK_EVALUATION,
            tokio::spawn(evaluation_loop(
                Arc::clone(inner),
                Arc::clone(&public),
                token.clone(),
            )),
        ));
        tasks.push((
            TASK_EXITS,
            tokio::spawn(exit_loop(Arc::clone(inner), token.clone())),
        ));
        tasks.push((
            TASK_RECONCILIATION,
            tokio::spawn(reconciliation_loop(Arc::clone(inner), token.clone())),
        ));
        tasks.push((
            TASK_HEALTH,
            tokio::spawn(health_loop(Arc::clone(inner), token.clone())),
        ));

        let task_count = tasks.len();
        *inner.run.lock() = Some(RunHandle {
            token,
            tasks,
            public,
            private,
        });
        inner.accepting_signals.store(true, Ordering::SeqCst);
        inner.transition(EngineState::Starting, EngineState::Running, "start")?;

        info!(
            tasks = task_count,
            strategies = inner.strategies.len(),
            instruments = config.connection.instruments.len(),
            "Engine started"
        );
        Ok(())
    }

    /// Graceful stop bounded by the configured shutdown timeout.
    pub async fn stop(&self) -> EngineResult<ShutdownReport> {
        self.inner.shutdown(None).await
    }

    /// Latch the kill-switch by hand and stop the engine.
    pub async fn emergency_stop(&self, message: impl Into<String>) -> EngineResult<ShutdownReport> {
        self.inner.latch.trigger(EmergencyReason::Manual {
            message: message.into(),
        });
        self.inner.shutdown(None).await
    }

    /// Operator acknowledgement after a kill-switch stop: clears the latch
    /// and closes every breaker so the next start begins fresh.
    pub fn clear_emergency(&self) {
        if let Some(reason) = self.inner.latch.reason() {
            info!(reason = %reason, "Clearing emergency latch");
        }
        self.inner.latch.clear();
        self.inner.registry.reset_all();
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    pub fn is_accepting_signals(&self) -> bool {
        self.inner.accepting_signals.load(Ordering::SeqCst)
    }

    pub fn public_status(&self) -> Option<ConnectionStatus> {
        self.inner.run.lock().as_ref().map(|run| run.public.status())
    }

    pub fn private_status(&self) -> Option<ConnectionStatus> {
        self.inner
            .run
            .lock()
            .as_ref()
            .and_then(|run| run.private.as_ref().map(|p| p.status()))
    }

    pub fn ledger(&self) -> &Arc<ExposureLedger> {
        &self.inner.ledger
    }

    pub fn positions(&self) -> &Arc<PositionBook> {
        &self.inner.positions
    }

    pub fn market(&self) -> &Arc<MarketState> {
        &self.inner.market
    }

    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.inner.registry
    }

    pub fn latch(&self) -> &Arc<EmergencyLatch> {
        &self.inner.latch
    }
}

impl EngineInner {
    fn transition(
        &self,
        from: EngineState,
        to: EngineState,
        action: &'static str,
    ) -> EngineResult<()> {
        let mut observed = from;
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                observed = *state;
                false
            }
        });
        if !changed {
            return Err(EngineError::InvalidState {
                action,
                state: observed,
            });
        }
        Metrics::engine_state_set(&to.as_str().to_ascii_lowercase());
        info!(from = %from, to = %to, "Engine state changed");
        Ok(())
    }

    /// Stop sequence shared by the operator path and the kill-switch.
    /// `exclude` names a task that is itself running the stop.
    async fn shutdown(&self, exclude: Option<&str>) -> EngineResult<ShutdownReport> {
        self.transition(EngineState::Running, EngineState::Stopping, "stop")?;
        self.accepting_signals.store(false, Ordering::SeqCst);

        let timeout = self.config.engine.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        info!(timeout_ms = timeout.as_millis() as u64, "Engine stopping");

        let mut report = ShutdownReport {
            cancelled_orders: self.cancel_resting_orders(deadline).await,
            ..ShutdownReport::default()
        };

        let run = self.run.lock().take();
        if let Some(run) = run {
            run.token.cancel();
            for (name, mut handle) in run.tasks {
                if exclude == Some(name) {
                    continue;
                }
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(Ok(TaskExit::Cancelled)) => debug!(task = name, "Task stopped"),
                    Ok(Ok(TaskExit::Failed(reason))) => {
                        warn!(task = name, %reason, "Task had already failed");
                        report.failed.push(name.to_string());
                    }
                    Ok(Err(e)) => {
                        error!(task = name, error = %e, "Task panicked");
                        report.failed.push(name.to_string());
                    }
                    Err(_) => {
                        handle.abort();
                        error!(task = name, "Task missed the shutdown deadline, aborted");
                        report.abandoned.push(name.to_string());
                    }
                }
            }
        }
        report.clean = report.abandoned.is_empty();

        self.state.send_replace(EngineState::Stopped);
        Metrics::engine_state_set("stopped");
        info!(
            clean = report.clean,
            abandoned = ?report.abandoned,
            failed = ?report.failed,
            cancelled_orders = report.cancelled_orders,
            open_positions = self.positions.len(),
            "Engine stopped"
        );
        Ok(report)
    }

    async fn cancel_resting_orders(&self, deadline: Instant) -> usize {
        match tokio::time::timeout_at(deadline, self.submitter.cancel_all()).await {
            Ok(Ok(cancelled)) => {
                for cloid in &cancelled {
                    self.on_order_gone(cloid);
                }
                if !cancelled.is_empty() {
                    info!(count = cancelled.len(), "Resting orders cancelled");
                }
                cancelled.len()
            }
            Ok(Err(e)) => {
                error!(
                    kind = %e.kind(),
                    error = %e,
                    resting_entries = self.positions.resting_entries().len(),
                    "Failed to cancel resting orders"
                );
                0
            }
            Err(_) => {
                error!(
                    kind = FaultKind::Retryable.as_str(),
                    "Cancelling resting orders timed out"
                );
                0
            }
        }
    }

    /// An order left the book without (further) fills.
    fn on_order_gone(&self, cloid: &ClientOrderId) {
        if let Some(reservation) = self.positions.cancel_entry(cloid) {
            self.ledger.release(reservation);
        } else if let Some(id) = self.positions.closing_position(cloid) {
            self.positions.abort_close(id);
            self.exit_reasons.remove(&id);
            warn!(position = %id, cloid = %cloid, "Closing order cancelled, position stays open");
        }
    }

    async fn execute_entry(&self, signal: Signal) {
        let order = match self.gate.admit(&signal) {
            Ok(order) => order,
            Err(_) => return,
        };
        let request = order.request();
        let cloid = request.client_order_id.clone();
        let entry = PendingEntry {
            instrument: signal.instrument.clone(),
            side: signal.direction,
            reservation: order.reservation(),
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            strategy_id: signal.strategy_id.clone(),
        };
        // Resting types are tracked up front so stream fills that beat the
        // acknowledgement still find their entry.
        let tracked = request.order_type.can_rest();
        if tracked {
            self.positions.track_entry(cloid.clone(), entry.clone());
        }

        match self.submitter.submit(&order).await {
            Ok(ack) => match ack.status {
                OrderStatus::Filled(fill) if tracked => {
                    match self.positions.on_entry_fill(&cloid, fill.price, fill.quantity) {
                        Ok(Some(_)) => {
                            self.ledger.settle(order.reservation());
                        }
                        Ok(None) => {}
                        Err(e) => warn!(kind = %e.kind(), cloid = %cloid, error = %e, "Entry fill rejected"),
                    }
                    self.positions.complete_entry(&cloid);
                }
                OrderStatus::Filled(fill) => {
                    self.ledger.settle(order.reservation());
                    if let Err(e) = self.positions.open(entry, fill.price, fill.quantity) {
                        self.ledger.release(order.reservation());
                        error!(kind = %e.kind(), cloid = %cloid, error = %e, "Filled entry could not be booked");
                    }
                }
                OrderStatus::Resting => {
                    if !tracked {
                        self.positions.track_entry(cloid.clone(), entry);
                    }
                    debug!(cloid = %cloid, exchange_id = %ack.exchange_order_id, "Entry order resting");
                }
            },
            Err(e) if e.outcome_unknown() => {
                // The order may be live: keep the exposure and the entry so
                // a stream fill opens the position and a cancel releases it.
                if !tracked {
                    self.positions.track_entry(cloid.clone(), entry);
                }
                self.ledger.mark_unresolved(order.reservation());
                Metrics::ledger_anomaly("unresolved");
                error!(
                    kind = %e.kind(),
                    cloid = %cloid,
                    instrument = %signal.instrument,
                    strategy = %signal.strategy_id,
                    amount = %signal.size,
                    error = %e,
                    "Order outcome unknown, exposure kept until a fill or cancel"
                );
            }
            Err(e) => {
                if tracked {
                    self.positions.cancel_entry(&cloid);
                }
                self.ledger.release(order.reservation());
                warn!(
                    kind = %e.kind(),
                    cloid = %cloid,
                    instrument = %signal.instrument,
                    strategy = %signal.strategy_id,
                    error = %e,
                    "Order submission failed, reservation released"
                );
            }
        }
    }

    async fn check_exits(&self) {
        let max_age = self.config.engine.quote_max_age();
        for position in self.positions.snapshot() {
            if self.positions.is_closing(position.id) {
                continue;
            }
            let Some(mark) = self.market.fresh_mark(&position.instrument, max_age) else {
                continue;
            };
            let Some(reason) = self.config.exits.evaluate(&position, mark) else {
                continue;
            };
            self.close_position(&position, mark, reason).await;
        }
    }

    /// Submit a reduce-only market close for `position`.
    async fn close_position(&self, position: &Position, mark: Price, reason: ExitReason) {
        let order = self.gate.admit_close(position, OrderType::Market, mark);
        let cloid = order.request().client_order_id.clone();
        if let Err(e) = self.positions.begin_close(position.id, cloid.clone()) {
            debug!(position = %position.id, error = %e, "Exit skipped");
            return;
        }
        self.exit_reasons.insert(position.id, reason);
        info!(
            position = %position.id,
            instrument = %position.instrument,
            mark = %mark,
            reason = %reason,
            "Exit triggered"
        );

        match self.submitter.submit(&order).await {
            Ok(ack) => match ack.status {
                OrderStatus::Filled(fill) => self.finish_exit(position.id, fill.price),
                OrderStatus::Resting => {
                    debug!(position = %position.id, cloid = %cloid, "Closing order resting")
                }
            },
            Err(e) => {
                self.positions.abort_close(position.id);
                self.exit_reasons.remove(&position.id);
                warn!(
                    kind = %e.kind(),
                    position = %position.id,
                    error = %e,
                    "Closing order failed, will retry"
                );
            }
        }
    }

    /// Close every open position at its latest mark, falling back to the
    /// entry price when no quote has been seen.
    async fn close_all(&self, reason: ExitReason) {
        for position in self.positions.snapshot() {
            if self.positions.is_closing(position.id) {
                continue;
            }
            let mark = self
                .market
                .get_quote(&position.instrument)
                .and_then(|q| q.mark())
                .unwrap_or(position.entry_price);
            self.close_position(&position, mark, reason).await;
        }
    }

    /// Minimum-balance protection. Below `min_balance_required` new entries
    /// stop for the rest of the run and open positions are closed; below
    /// `min_balance_alert` a warning is logged. A missing or zero balance
    /// means the account did not report one and is skipped.
    async fn check_balance(&self, balances: &HashMap<String, Decimal>) {
        let risk = &self.config.risk;
        let asset = risk.balance_asset.as_str();
        let Some(balance) = balances
            .get(asset)
            .or_else(|| balances.get(&format!("Z{asset}")))
            .copied()
        else {
            return;
        };
        if balance <= Decimal::ZERO {
            return;
        }

        if balance < risk.min_balance_required {
            if self.accepting_signals.swap(false, Ordering::SeqCst) {
                Metrics::risk_decision("rejected_balance");
                error!(
                    kind = FaultKind::RiskViolation.as_str(),
                    asset,
                    balance = %balance,
                    minimum = %risk.min_balance_required,
                    open_positions = self.positions.len(),
                    "Balance below minimum, new entries suspended"
                );
            }
            self.close_all(ExitReason::LowBalance).await;
        } else if balance < risk.min_balance_alert {
            warn!(
                asset,
                balance = %balance,
                alert = %risk.min_balance_alert,
                "Low balance"
            );
        }
    }

    fn finish_exit(&self, id: PositionId, price: Price) {
        let reason = self.exit_reasons.remove(&id).map(|(_, reason)| reason);
        let Some(position) = self.positions.close(id) else {
            return;
        };
        self.ledger.release(position.reservation);

        let pct = pnl_pct(&position, price);
        let label = reason.map_or("external", |r| r.as_str());
        Metrics::trade_pnl(position.instrument.as_str(), label, pct.to_f64().unwrap_or(0.0));
        info!(
            position = %id,
            instrument = %position.instrument,
            exit_price = %price,
            pnl_pct = %pct.round_dp(3),
            reason = label,
            "Position exited"
        );
    }

    fn apply_event(&self, event: MarketEvent) {
        match event {
            MarketEvent::Quote(quote) => self.market.update_quote(quote),
            MarketEvent::Execution(exec) => self.on_execution(exec),
            MarketEvent::Balance(balance) => {
                debug!(asset = %balance.asset, balance = %balance.balance, "Balance update")
            }
        }
    }

    fn on_execution(&self, exec: ExecutionEvent) {
        let Some(cloid) = exec.client_order_id.clone() else {
            debug!(order_id = ?exec.order_id, "Execution without client order id ignored");
            return;
        };
        let fully_filled =
            exec.exec_type == ExecType::Filled || exec.order_status.as_deref() == Some("filled");

        if self.positions.is_entry(&cloid) {
            if let Some((price, quantity)) = exec.fill() {
                match self.positions.on_entry_fill(&cloid, price, quantity) {
                    Ok(Some(position)) => {
                        self.ledger.settle(position.reservation);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(kind = %e.kind(), cloid = %cloid, error = %e, "Entry fill rejected")
                    }
                }
            }
            if exec.is_cancelled() {
                self.on_order_gone(&cloid);
            } else if fully_filled {
                self.positions.complete_entry(&cloid);
            }
        } else if let Some(id) = self.positions.closing_position(&cloid) {
            if exec.is_cancelled() {
                self.on_order_gone(&cloid);
            } else if fully_filled {
                let price = exec
                    .fill()
                    .map(|(price, _)| price)
                    .or(exec.last_price)
                    .or_else(|| self.last_mark(id));
                match price {
                    Some(price) => self.finish_exit(id, price),
                    None => warn!(position = %id, "Closing fill without a price, waiting for reconciliation"),
                }
            }
        } else {
            debug!(cloid = %cloid, exec_type = ?exec.exec_type, "Execution for unknown order");
        }
    }

    fn last_mark(&self, id: PositionId) -> Option<Price> {
        let position = self.positions.get(id)?;
        self.market.get_quote(&position.instrument)?.mark()
    }

    /// Apply an account snapshot taken at `as_of`.
    fn reconcile(&self, exposures: &HashMap<InstrumentId, Notional>, as_of: DateTime<Utc>) {
        let tolerance = Notional::new(self.config.risk.reconcile_tolerance);
        let report = self.ledger.reconcile(exposures, tolerance, as_of);
        if report.is_clean() {
            debug!(instruments = exposures.len(), "Ledger matches account");
            return;
        }
        let removed = self.positions.remove_by_reservation(&report.released);
        for position in &removed {
            self.exit_reasons.remove(&position.id);
        }
        info!(
            drifts = report.drifts.len(),
            released = report.released.len(),
            positions_removed = removed.len(),
            "Reconciliation applied"
        );
    }

    fn report_leaks(&self, max_age: Duration) {
        for reservation in self.ledger.stale_pending(max_age) {
            Metrics::ledger_anomaly("leak");
            error!(
                kind = FaultKind::RiskViolation.as_str(),
                reservation = %reservation.id,
                instrument = %reservation.instrument,
                amount = %reservation.amount,
                age_secs = reservation.age().as_secs(),
                "Reservation pending past leak age"
            );
        }
        for reservation in self.ledger.unresolved() {
            if reservation.age() >= max_age {
                warn!(
                    reservation = %reservation.id,
                    instrument = %reservation.instrument,
                    amount = %reservation.amount,
                    age_secs = reservation.age().as_secs(),
                    "Reservation still unresolved, exposure held"
                );
            }
        }
    }
}

fn spawn_session(connection: Arc<ConnectionManager>) -> JoinHandle<TaskExit> {
    tokio::spawn(async move {
        match connection.run().await {
            Ok(()) => TaskExit::Cancelled,
            Err(e) => {
                error!(
                    session = %connection.name(),
                    kind = %e.kind(),
                    error = %e,
                    "Session ended"
                );
                TaskExit::Failed(e.to_string())
            }
        }
    })
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn dispatch_loop(
    inner: Arc<EngineInner>,
    mut rx: mpsc::Receiver<StreamMessage>,
    token: CancellationToken,
) -> TaskExit {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => return TaskExit::Cancelled,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            if token.is_cancelled() {
                return TaskExit::Cancelled;
            }
            warn!("Every session ended, dispatcher exiting");
            return TaskExit::Failed("stream channel closed".to_string());
        };
        match message {
            StreamMessage::Data(data) => {
                for event in inner.parser.parse(&data) {
                    inner.apply_event(event);
                }
            }
            StreamMessage::Status(items) => debug!(items = items.len(), "Exchange status update"),
            other => debug!(message = ?other, "Stream message ignored"),
        }
    }
}

async fn evaluation_loop(
    inner: Arc<EngineInner>,
    public: Arc<ConnectionManager>,
    token: CancellationToken,
) -> TaskExit {
    let mut ticker = ticker(inner.config.engine.evaluation_interval());
    let max_age = inner.config.engine.quote_max_age();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return TaskExit::Cancelled,
            _ = ticker.tick() => {}
        }
        Metrics::loop_iteration(TASK_EVALUATION);

        let status = public.status();
        if !status.is_connected() || !status.available {
            debug!(state = %status.state, available = status.available, "Market data unavailable, skipping evaluation");
            continue;
        }
        let snapshot = inner.market.snapshot(max_age);
        if snapshot.is_empty() {
            continue;
        }

        for strategy in &inner.strategies {
            let signals = tokio::select! {
                biased;
                _ = token.cancelled() => return TaskExit::Cancelled,
                signals = strategy.evaluate(&snapshot) => signals,
            };
            for signal in signals {
                if !inner.accepting_signals.load(Ordering::SeqCst) {
                    debug!(strategy = strategy.id(), "Signal dropped, engine not accepting");
                    continue;
                }
                inner.execute_entry(signal).await;
            }
        }
    }
}

async fn exit_loop(inner: Arc<EngineInner>, token: CancellationToken) -> TaskExit {
    let mut ticker = ticker(inner.config.engine.exit_check_interval());
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return TaskExit::Cancelled,
            _ = ticker.tick() => {}
        }
        Metrics::loop_iteration(TASK_EXITS);
        inner.check_exits().await;
    }
}

async fn reconciliation_loop(inner: Arc<EngineInner>, token: CancellationToken) -> TaskExit {
    let mut ticker = ticker(inner.config.engine.reconciliation_interval());
    let leak_age = inner.config.engine.reservation_leak_age();
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return TaskExit::Cancelled,
            _ = ticker.tick() => {}
        }
        Metrics::loop_iteration(TASK_RECONCILIATION);

        let requested_at = Utc::now();
        let snapshot = tokio::select! {
            biased;
            _ = token.cancelled() => return TaskExit::Cancelled,
            snapshot = inner.submitter.account_snapshot() => snapshot,
        };
        match snapshot {
            Ok(snapshot) => {
                inner.reconcile(&snapshot.exposures, snapshot.as_of.unwrap_or(requested_at));
                inner.check_balance(&snapshot.balances).await;
            }
            Err(e) => warn!(kind = %e.kind(), error = %e, "Reconciliation skipped"),
        }
        inner.report_leaks(leak_age);
    }
}

/// Counts consecutive checks each breaker spends outside CLOSED and trips
/// the kill-switch once any count reaches `emergency_open_checks`.
async fn health_loop(inner: Arc<EngineInner>, token: CancellationToken) -> TaskExit {
    let mut ticker = ticker(inner.config.engine.health_check_interval());
    let threshold = inner.config.engine.emergency_open_checks;
    let mut streaks: HashMap<String, u32> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return TaskExit::Cancelled,
            _ = ticker.tick() => {}
        }
        Metrics::loop_iteration(TASK_HEALTH);

        let unhealthy = inner.registry.unhealthy();
        streaks.retain(|name, _| unhealthy.contains(name));
        for name in &unhealthy {
            *streaks.entry(name.clone()).or_insert(0) += 1;
        }
        if unhealthy.is_empty() {
            continue;
        }

        let mut stuck: Vec<String> = streaks
            .iter()
            .filter(|(_, checks)| **checks >= threshold)
            .map(|(name, _)| name.clone())
            .collect();
        if stuck.is_empty() {
            warn!(
                kind = FaultKind::CircuitOpen.as_str(),
                breakers = ?unhealthy,
                "Breakers not closed"
            );
            continue;
        }
        stuck.sort();
        let checks = stuck
            .iter()
            .filter_map(|name| streaks.get(name))
            .copied()
            .max()
            .unwrap_or(threshold);

        inner
            .latch
            .trigger(EmergencyReason::BreakersStuckOpen { breakers: stuck, checks });
        match inner.shutdown(Some(TASK_HEALTH)).await {
            Ok(report) => info!(clean = report.clean, "Engine halted by kill-switch"),
            Err(e) => warn!(kind = %e.kind(), error = %e, "Kill-switch stop skipped"),
        }
        return TaskExit::Cancelled;
    }
}
