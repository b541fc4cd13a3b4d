//! WebSocket connection manager.
//!
//! Owns one logical streaming session: connects, authenticates, replays
//! subscriptions, runs the read loop, and reconnects on failure. Every
//! connection attempt goes through the session's circuit breaker; while
//! the breaker is open the manager reports itself unavailable and waits
//! out the cooldown instead of hammering the endpoint. The same holds
//! while the rolling attempt cap is exhausted.

use crate::attempts::AttemptWindow;
use crate::auth::{AuthToken, AuthTokenSource};
use crate::backoff::ReconnectPolicy;
use crate::error::{WsError, WsResult};
use crate::heartbeat::Watchdog;
use crate::message::{parse_frame, Channel, Frame, MethodAck, Request, StreamMessage};
use crate::subscription::{ChannelSpec, SubscriptionSet};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sentinel_resilience::{BreakerState, CallError, CircuitBreaker};
use sentinel_telemetry::Metrics;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const KRAKEN_PUBLIC_URL: &str = "wss://ws.kraken.com/v2";
pub const KRAKEN_PRIVATE_URL: &str = "wss://ws-auth.kraken.com/v2";

const COMMAND_QUEUE: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Session name used in logs and metrics ("public", "private").
    pub name: String,
    pub url: String,
    /// Subscriptions established on every connect.
    pub subscriptions: Vec<ChannelSpec>,
    pub reconnect: ReconnectPolicy,
    /// Bound on connect + authenticate + subscribe.
    pub connect_timeout: Duration,
    /// Silence after which the session is considered dead.
    pub watchdog_timeout: Duration,
    /// Maximum consecutive failed attempts (0 = infinite).
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "public".to_string(),
            url: KRAKEN_PUBLIC_URL.to_string(),
            subscriptions: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            watchdog_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 0,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
        }
    }

    /// CONNECTED is only reachable from CONNECTING.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every change through [`ConnectionManager::status_receiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect.
    pub attempts: u32,
    /// False while the session's breaker or attempt cap refuses attempts.
    pub available: bool,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            available: true,
        }
    }
}

#[derive(Debug)]
enum Command {
    Subscribe(ChannelSpec),
    Unsubscribe(ChannelSpec),
}

struct Session {
    write: WsSink,
    read: WsSource,
    token: Option<AuthToken>,
}

/// WebSocket connection manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    subscriptions: SubscriptionSet,
    breaker: Arc<CircuitBreaker>,
    token_source: Option<Arc<dyn AuthTokenSource>>,
    message_tx: mpsc::Sender<StreamMessage>,
    status_tx: watch::Sender<ConnectionStatus>,
    command_tx: mpsc::Sender<Command>,
    command_rx: TokioMutex<mpsc::Receiver<Command>>,
    next_req_id: AtomicU64,
    attempts: Mutex<AttemptWindow>,
    shutdown_token: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        message_tx: mpsc::Sender<StreamMessage>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let attempts = AttemptWindow::new(
            config.reconnect.attempt_limit,
            config.reconnect.attempt_window,
        );
        Self {
            subscriptions: SubscriptionSet::new(config.subscriptions.iter().cloned()),
            config,
            breaker,
            token_source: None,
            message_tx,
            status_tx,
            command_tx,
            command_rx: TokioMutex::new(command_rx),
            next_req_id: AtomicU64::new(0),
            attempts: Mutex::new(attempts),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Token provider for private channels.
    pub fn with_token_source(mut self, source: Arc<dyn AuthTokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Tie the session's lifetime to an external token (e.g. a child of
    /// the engine's run token).
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.status_tx.borrow().state
    }

    pub fn is_available(&self) -> bool {
        self.status_tx.borrow().available
    }

    pub fn subscriptions(&self) -> Vec<ChannelSpec> {
        self.subscriptions.specs()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Signal graceful shutdown.
    pub fn shutdown(&self) {
        info!(session = %self.config.name, "ConnectionManager shutdown requested");
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Add a subscription. It is sent immediately when connected and
    /// replayed on every reconnect.
    pub fn subscribe(&self, spec: ChannelSpec) {
        let Some(delta) = self.subscriptions.insert(spec) else {
            return;
        };
        info!(
            session = %self.config.name,
            channel = %delta.channel(),
            symbols = ?delta.symbols(),
            "Subscribing"
        );
        self.enqueue(Command::Subscribe(delta));
    }

    /// Remove a subscription (all symbols when `spec` has none).
    pub fn unsubscribe(&self, spec: ChannelSpec) {
        let Some(removed) = self.subscriptions.remove(&spec) else {
            return;
        };
        info!(
            session = %self.config.name,
            channel = %removed.channel(),
            symbols = ?removed.symbols(),
            "Unsubscribing"
        );
        self.enqueue(Command::Unsubscribe(removed));
    }

    fn enqueue(&self, command: Command) {
        match self.command_tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                warn!(
                    session = %self.config.name,
                    ?command,
                    "Command queue full, change applies on next reconnect"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Drive the session until shutdown.
    ///
    /// Returns `Ok(())` after a requested shutdown and an error only when
    /// `max_reconnect_attempts` is exhausted.
    pub async fn run(&self) -> WsResult<()> {
        let name = self.config.name.as_str();
        info!(session = name, url = %self.config.url, "Connection manager started");
        let mut failures = 0u32;

        loop {
            if self.is_shutdown() {
                return self.finish();
            }
            let limited = self.attempts.lock().wait_time(Instant::now());
            if let Some(wait) = limited {
                self.set_available(false);
                warn!(
                    session = name,
                    limit = self.config.reconnect.attempt_limit,
                    window_secs = self.config.reconnect.attempt_window.as_secs(),
                    wait_ms = wait.as_millis() as u64,
                    "Connection attempt limit reached, waiting for the window"
                );
                if !self.sleep_or_shutdown(wait).await {
                    return self.finish();
                }
                if self.breaker.state() != BreakerState::Open {
                    self.set_available(true);
                }
                continue;
            }
            self.transition(ConnectionState::Connecting)?;

            let attempt = tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => return self.finish(),
                r = self.breaker.call(|| self.establish()) => r,
            };

            let outcome = match attempt {
                Ok(session) => {
                    self.transition(ConnectionState::Connected)?;
                    self.set_available(true);
                    failures = 0;
                    info!(session = name, "WebSocket connected");
                    self.run_session(session).await
                }
                Err(CallError::CircuitOpen(open)) => {
                    self.transition(ConnectionState::Reconnecting)?;
                    self.set_available(false);
                    warn!(
                        session = name,
                        kind = %open.kind(),
                        retry_in_ms = open.retry_in.as_millis() as u64,
                        "Connection unavailable, waiting for breaker cooldown"
                    );
                    let wait = open.retry_in.max(Duration::from_millis(1));
                    if !self.sleep_or_shutdown(wait).await {
                        return self.finish();
                    }
                    continue;
                }
                Err(e) => Err(WsError::from(e)),
            };

            match outcome {
                Ok(()) if self.is_shutdown() => return self.finish(),
                Ok(()) => info!(session = name, "Session ended"),
                Err(e) => warn!(session = name, kind = %e.kind(), error = %e, "Session failed"),
            }

            failures = failures.saturating_add(1);
            if self.config.max_reconnect_attempts > 0
                && failures >= self.config.max_reconnect_attempts
            {
                error!(
                    session = name,
                    kind = "connection_fatal",
                    attempts = failures,
                    "Max reconnection attempts reached"
                );
                self.transition(ConnectionState::Disconnected)?;
                return Err(WsError::AttemptsExhausted(failures));
            }

            self.transition(ConnectionState::Reconnecting)?;
            self.status_tx.send_modify(|s| s.attempts = failures);
            if self.breaker.state() == BreakerState::Open {
                self.set_available(false);
            }

            let tier = self.config.reconnect.tier(failures);
            let delay = self.config.reconnect.delay(failures);
            Metrics::ws_reconnect(name, tier.as_str());
            warn!(
                session = name,
                attempt = failures,
                tier = tier.as_str(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            if !self.sleep_or_shutdown(delay).await {
                return self.finish();
            }
        }
    }

    fn finish(&self) -> WsResult<()> {
        if self.state() != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected)?;
        }
        info!(session = %self.config.name, "Connection manager stopped");
        Ok(())
    }

    /// Cancellation-aware sleep. Returns false if shutdown was requested.
    async fn sleep_or_shutdown(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.shutdown_token.cancelled() => false,
        }
    }

    fn transition(&self, to: ConnectionState) -> WsResult<()> {
        let mut from = to;
        let applied = self.status_tx.send_if_modified(|status| {
            from = status.state;
            if !status.state.can_transition_to(to) {
                return false;
            }
            status.state = to;
            if to == ConnectionState::Connected {
                status.attempts = 0;
            }
            true
        });
        if !applied {
            error!(
                session = %self.config.name,
                kind = "connection_fatal",
                %from,
                %to,
                "Illegal connection state transition refused"
            );
            return Err(WsError::InvalidTransition { from, to });
        }
        Metrics::ws_state_set(&self.config.name, &to.as_str().to_ascii_lowercase());
        debug!(session = %self.config.name, %from, %to, "Connection state changed");
        Ok(())
    }

    fn set_available(&self, available: bool) {
        let changed = self.status_tx.send_if_modified(|s| {
            let changed = s.available != available;
            s.available = available;
            changed
        });
        if changed {
            Metrics::ws_unavailable(&self.config.name, !available);
        }
    }

    fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn fetch_token(&self) -> WsResult<AuthToken> {
        let source = self.token_source.as_ref().ok_or_else(|| {
            WsError::Authentication("private channel configured without a token source".into())
        })?;
        source.token().await
    }

    /// Connect, authenticate and subscribe, bounded by `connect_timeout`.
    async fn establish(&self) -> WsResult<Session> {
        self.attempts.lock().record(Instant::now());
        let handshake = async {
            info!(session = %self.config.name, url = %self.config.url, "Connecting to WebSocket");
            let (stream, _response) =
                connect_async_tls_with_config(self.config.url.as_str(), None, true, None).await?;
            let (write, read) = stream.split();
            let token = if self.subscriptions.requires_token() {
                Some(self.fetch_token().await?)
            } else {
                None
            };
            let mut session = Session { write, read, token };
            self.replay_subscriptions(&mut session).await?;
            Ok(session)
        };

        match tokio::time::timeout(self.config.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(WsError::ConnectTimeout(self.config.connect_timeout)),
        }
    }

    async fn replay_subscriptions(&self, session: &mut Session) -> WsResult<()> {
        // Anything queued before this snapshot is covered by the replay.
        {
            let mut commands = self.command_rx.lock().await;
            while commands.try_recv().is_ok() {}
        }
        self.subscriptions.reset_acks();
        let specs = self.subscriptions.specs();
        if specs.is_empty() {
            return Ok(());
        }

        let mut pending: HashMap<u64, Channel> = HashMap::with_capacity(specs.len());
        for spec in &specs {
            let req_id = self.next_req_id();
            let token = session.token.as_ref().map(AuthToken::expose);
            let text = Request::subscribe(spec, token, req_id).to_text()?;
            session.write.send(Message::Text(text)).await?;
            pending.insert(req_id, spec.channel());
        }
        info!(
            session = %self.config.name,
            count = specs.len(),
            "Subscriptions sent, awaiting acknowledgements"
        );

        while !pending.is_empty() {
            let text = match session.read.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Ping(data))) => {
                    session.write.send(Message::Pong(data)).await?;
                    continue;
                }
                Some(Ok(Message::Close(frame))) => return Err(closed_error(frame)),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(WsError::ConnectionClosed {
                        code: 1006,
                        reason: "stream ended during subscription".to_string(),
                    })
                }
            };

            let Some(ack) = self.dispatch(&text).await else {
                continue;
            };
            let Some(channel) = ack.req_id.and_then(|id| pending.remove(&id)) else {
                self.on_ack(ack);
                continue;
            };
            if !ack.success {
                let reason = ack.error.unwrap_or_default();
                return Err(if channel.is_private() {
                    WsError::Authentication(format!("{channel}: {reason}"))
                } else {
                    WsError::SubscriptionRejected {
                        channel: channel.to_string(),
                        reason,
                    }
                });
            }
            self.subscriptions.mark_acked(channel);
        }

        info!(session = %self.config.name, "All subscriptions acknowledged");
        Ok(())
    }

    async fn run_session(&self, mut session: Session) -> WsResult<()> {
        let mut watchdog = Watchdog::new(self.config.watchdog_timeout);
        let period = watchdog.check_interval();
        let mut check = tokio::time::interval_at(Instant::now() + period, period);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands = self.command_rx.lock().await;

        loop {
            tokio::select! {
                biased;

                () = self.shutdown_token.cancelled() => {
                    info!(session = %self.config.name, "Shutdown signal received in message loop");
                    if let Err(e) = session.write.send(Message::Close(None)).await {
                        debug!(?e, "Failed to send Close frame during shutdown");
                    }
                    return Ok(());
                }

                frame = session.read.next() => {
                    if let Some(Ok(_)) = &frame {
                        watchdog.record_traffic();
                    }
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(ack) = self.dispatch(&text).await {
                                self.on_ack(ack);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            session.write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => return Err(closed_error(frame)),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(WsError::ConnectionClosed {
                                code: 1006,
                                reason: "stream ended".to_string(),
                            })
                        }
                    }
                }

                Some(command) = commands.recv() => {
                    self.apply_command(&mut session, command).await?;
                }

                _ = check.tick() => {
                    if watchdog.is_expired() {
                        warn!(
                            session = %self.config.name,
                            kind = "retryable",
                            idle_ms = watchdog.idle_for().as_millis() as u64,
                            "Watchdog expired, forcing reconnect"
                        );
                        return Err(WsError::WatchdogTimeout(watchdog.timeout()));
                    }
                    if watchdog.should_ping() {
                        let text = Request::ping(self.next_req_id()).to_text()?;
                        session.write.send(Message::Text(text)).await?;
                        watchdog.record_ping();
                        debug!(session = %self.config.name, "Sent keepalive ping");
                    }
                }
            }
        }
    }

    async fn apply_command(&self, session: &mut Session, command: Command) -> WsResult<()> {
        let (method, spec) = match &command {
            Command::Subscribe(spec) => ("subscribe", spec),
            Command::Unsubscribe(spec) => ("unsubscribe", spec),
        };
        if spec.requires_token() && session.token.is_none() {
            session.token = Some(self.fetch_token().await?);
        }
        let token = session.token.as_ref().map(AuthToken::expose);
        let req_id = self.next_req_id();
        let request = match command {
            Command::Subscribe(ref spec) => Request::subscribe(spec, token, req_id),
            Command::Unsubscribe(ref spec) => Request::unsubscribe(spec, token, req_id),
        };
        session.write.send(Message::Text(request.to_text()?)).await?;
        debug!(session = %self.config.name, method, req_id, "Request sent");
        Ok(())
    }

    /// Route one text frame. Data goes to the message channel; acks are
    /// returned to the caller; everything else is consumed here.
    async fn dispatch(&self, text: &str) -> Option<MethodAck> {
        match parse_frame(text) {
            Frame::Message(StreamMessage::Ack(ack)) => Some(ack),
            Frame::Message(StreamMessage::Heartbeat) => None,
            Frame::Message(StreamMessage::Pong { req_id }) => {
                debug!(session = %self.config.name, ?req_id, "Received pong");
                None
            }
            Frame::Message(msg) => {
                if self.message_tx.send(msg).await.is_err() {
                    debug!(session = %self.config.name, "Message receiver dropped");
                }
                None
            }
            Frame::Malformed(reason) => {
                warn!(
                    session = %self.config.name,
                    reason = reason.as_str(),
                    len = text.len(),
                    "Dropping malformed frame"
                );
                Metrics::ws_dropped(&self.config.name, reason.as_str());
                None
            }
            Frame::Unrecognised(discriminator) => {
                debug!(session = %self.config.name, %discriminator, "Ignoring unrecognised frame");
                Metrics::ws_dropped(&self.config.name, "unrecognised");
                None
            }
        }
    }

    fn on_ack(&self, ack: MethodAck) {
        if !ack.success {
            warn!(
                session = %self.config.name,
                kind = "connection_fatal",
                method = %ack.method,
                req_id = ?ack.req_id,
                error = ?ack.error,
                "Request rejected by server"
            );
            return;
        }
        match ack.channel() {
            Some(channel) if ack.method == "subscribe" => {
                self.subscriptions.mark_acked(channel);
                debug!(session = %self.config.name, %channel, "Subscription acknowledged");
            }
            _ => debug!(session = %self.config.name, method = %ack.method, "Request acknowledged"),
        }
    }
}

fn closed_error(frame: Option<CloseFrame<'_>>) -> WsError {
    let (code, reason) = frame
        .map(|f| (f.code.into(), f.reason.to_string()))
        .unwrap_or((1000, "Normal close".to_string()));
    warn!(code, %reason, "WebSocket closed by server");
    WsError::ConnectionClosed { code, reason }
}
