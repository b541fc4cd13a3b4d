//! Engine tests against an in-process exchange stream.
//!
//! Covers:
//! - Signal to position to exit through live ticker frames
//! - Signal suppression once stopping begins
//! - Unclean stop when an order submission never returns
//! - Kill-switch halt on a session breaker stuck open

mod integration;

use futures_util::future::{self, BoxFuture};
use integration::common::eventually;
use integration::common::mock_ws::MockExchange;
use rust_decimal_macros::dec;
use sentinel_bot::{AppConfig, Engine, EngineComponents, EngineState, Strategy};
use sentinel_core::{ClientOrderId, Notional, OrderRequest, OrderSide, Price, Signal};
use sentinel_executor::{AccountSnapshot, GatewayError, MockGateway, OrderAck, OrderGateway};
use sentinel_feed::MarketSnapshot;
use sentinel_risk::EmergencyReason;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Buys every instrument it sees, once or on every tick.
struct BuyStrategy {
    repeat: bool,
    fired: AtomicBool,
    evaluations: AtomicUsize,
    take_profit: Option<Price>,
}

impl BuyStrategy {
    fn once(take_profit: Price) -> Arc<Self> {
        Arc::new(Self {
            repeat: false,
            fired: AtomicBool::new(false),
            evaluations: AtomicUsize::new(0),
            take_profit: Some(take_profit),
        })
    }

    fn every_tick() -> Arc<Self> {
        Arc::new(Self {
            repeat: true,
            fired: AtomicBool::new(false),
            evaluations: AtomicUsize::new(0),
            take_profit: None,
        })
    }

    fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

impl Strategy for BuyStrategy {
    fn id(&self) -> &str {
        "buy-test"
    }

    fn evaluate<'a>(&'a self, market: &'a MarketSnapshot) -> BoxFuture<'a, Vec<Signal>> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        let fire = self.repeat || !self.fired.swap(true, Ordering::SeqCst);
        let signals = if fire {
            market
                .iter()
                .filter_map(|(instrument, quote)| {
                    let mark = quote.mark()?;
                    Some(
                        Signal::new(
                            self.id(),
                            instrument.clone(),
                            OrderSide::Buy,
                            Notional::new(dec!(1)),
                            mark,
                        )
                        .with_exits(None, self.take_profit),
                    )
                })
                .collect()
        } else {
            Vec::new()
        };
        Box::pin(future::ready(signals))
    }
}

/// Accepts submissions and never answers them.
#[derive(Default)]
struct HangingGateway {
    submits: AtomicUsize,
}

impl OrderGateway for HangingGateway {
    fn submit<'a>(
        &'a self,
        _order: &'a OrderRequest,
        _nonce: u64,
    ) -> BoxFuture<'a, Result<OrderAck, GatewayError>> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Box::pin(future::pending())
    }

    fn cancel_all(&self, _nonce: u64) -> BoxFuture<'_, Result<Vec<ClientOrderId>, GatewayError>> {
        Box::pin(future::ready(Ok(Vec::new())))
    }

    fn account_snapshot(&self, _nonce: u64) -> BoxFuture<'_, Result<AccountSnapshot, GatewayError>> {
        Box::pin(future::ready(Ok(AccountSnapshot::default())))
    }
}

fn config(url: String) -> AppConfig {
    let mut config = AppConfig::default();
    config.connection.public_url = url;
    config.connection.private_enabled = false;
    config.connection.instruments = vec!["XLM/USD".to_string()];
    config.connection.fast_retry_delay_ms = 20;
    config.connection.base_delay_ms = 50;
    config.connection.max_delay_ms = 200;
    config.engine.evaluation_interval_ms = 20;
    config.engine.exit_check_interval_ms = 20;
    config.engine.reconciliation_interval_ms = 3_600_000;
    config.engine.shutdown_timeout_ms = 2_000;
    config
}

fn engine(config: AppConfig, gateway: Arc<dyn OrderGateway>, strategy: Arc<BuyStrategy>) -> Engine {
    Engine::new(
        config,
        EngineComponents {
            gateway,
            strategies: vec![strategy as Arc<dyn Strategy>],
            token_source: None,
        },
    )
}

fn connected(engine: &Engine) -> bool {
    engine
        .public_status()
        .map(|s| s.is_connected())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_entry_and_take_profit_exit() {
    let exchange = MockExchange::start().await;
    let gateway = Arc::new(MockGateway::new());
    let strategy = BuyStrategy::once(Price::new(dec!(0.26)));
    let engine = engine(config(exchange.url()), gateway.clone(), strategy);

    engine.start().unwrap();
    assert!(eventually(WAIT, || connected(&engine)).await);

    assert!(
        eventually(WAIT, || {
            exchange.push_ticker("XLM/USD", 0.2500, 0.2502);
            engine.positions().len() == 1
        })
        .await,
        "entry never filled"
    );
    let position = engine.positions().snapshot()[0].clone();
    assert_eq!(position.side, OrderSide::Buy);
    assert_eq!(position.take_profit, Some(Price::new(dec!(0.26))));
    assert_eq!(engine.ledger().total(), Notional::new(dec!(1)));

    assert!(
        eventually(WAIT, || {
            exchange.push_ticker("XLM/USD", 0.2700, 0.2702);
            engine.positions().is_empty()
        })
        .await,
        "take-profit never fired"
    );
    assert!(engine.ledger().is_empty());

    let submits = gateway.submits();
    assert_eq!(submits.len(), 2);
    assert!(!submits[0].0.reduce_only);
    assert!(submits[1].0.reduce_only);
    assert_eq!(submits[1].0.side, OrderSide::Sell);

    let report = engine.stop().await.unwrap();
    assert!(report.clean, "{report:?}");
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_no_signals_after_stop() {
    let exchange = MockExchange::start().await;
    let gateway = Arc::new(MockGateway::new());
    let strategy = BuyStrategy::every_tick();
    let engine = engine(config(exchange.url()), gateway.clone(), strategy.clone());

    engine.start().unwrap();
    assert!(eventually(WAIT, || connected(&engine)).await);
    assert!(
        eventually(WAIT, || {
            exchange.push_ticker("XLM/USD", 0.2500, 0.2502);
            !gateway.submits().is_empty()
        })
        .await
    );

    let report = engine.stop().await.unwrap();
    assert!(report.clean);
    assert!(!engine.is_accepting_signals());

    let submits = gateway.submits().len();
    let evaluations = strategy.evaluations();
    exchange.push_ticker("XLM/USD", 0.2500, 0.2502);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.submits().len(), submits);
    assert_eq!(strategy.evaluations(), evaluations);
}

#[tokio::test]
async fn test_hanging_submit_makes_stop_unclean() {
    let exchange = MockExchange::start().await;
    let gateway = Arc::new(HangingGateway::default());
    let mut config = config(exchange.url());
    config.engine.shutdown_timeout_ms = 300;
    let engine = engine(config, gateway.clone(), BuyStrategy::once(Price::new(dec!(1))));

    engine.start().unwrap();
    assert!(eventually(WAIT, || connected(&engine)).await);
    assert!(
        eventually(WAIT, || {
            exchange.push_ticker("XLM/USD", 0.2500, 0.2502);
            gateway.submits.load(Ordering::SeqCst) == 1
        })
        .await
    );

    let report = engine.stop().await.unwrap();
    assert!(!report.clean);
    assert_eq!(report.abandoned, vec!["evaluation".to_string()]);
    assert_eq!(engine.state(), EngineState::Stopped);

    // The stuck submit's reservation is still pending.
    assert_eq!(engine.ledger().len(), 1);
}

#[tokio::test]
async fn test_stuck_session_breaker_trips_kill_switch() {
    // Nothing listens on port 1: every connect attempt fails fast.
    let mut config = config("ws://127.0.0.1:1".to_string());
    config.connection.fast_retry_count = 3;
    config.breakers.ws_public.failure_threshold = 4;
    config.breakers.ws_public.open_timeout_ms = 3_600_000;
    config.engine.health_check_interval_ms = 50;
    config.engine.emergency_open_checks = 3;

    let engine = engine(
        config,
        Arc::new(MockGateway::new()),
        BuyStrategy::every_tick(),
    );
    let mut state = engine.state_receiver();
    engine.start().unwrap();

    tokio::time::timeout(WAIT, state.wait_for(|s| *s == EngineState::Stopped))
        .await
        .expect("kill-switch did not stop the engine")
        .unwrap();

    match engine.latch().reason() {
        Some(EmergencyReason::BreakersStuckOpen { breakers, .. }) => {
            assert_eq!(breakers, vec!["ws-public".to_string()]);
        }
        other => panic!("unexpected reason {other:?}"),
    }
    assert!(engine.start().is_err());

    engine.clear_emergency();
    assert!(!engine.latch().is_triggered());
    assert!(engine.registry().unhealthy().is_empty());
}
