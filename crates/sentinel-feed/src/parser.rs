//! Message parsing for market and account data.
//!
//! Parses validated channel payloads into typed events. A bad item is
//! logged and skipped; the rest of the frame is still processed.

use crate::error::{FeedError, FeedResult};
use rust_decimal::Decimal;
use sentinel_core::{ClientOrderId, InstrumentId, OrderSide, Price, Quote, Size};
use sentinel_ws::{Channel, ChannelData};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Decimal from a JSON number or string. Numbers go through their
/// shortest textual form so `0.2502` stays `0.2502`.
fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

fn de_decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
    let value = Value::deserialize(d)?;
    decimal_from_value(&value).ok_or_else(|| D::Error::custom(format!("not a decimal: {value}")))
}

fn de_decimal_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Decimal>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        value => decimal_from_value(&value)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("not a decimal: {value}"))),
    }
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    symbol: String,
    #[serde(deserialize_with = "de_decimal")]
    bid: Decimal,
    #[serde(deserialize_with = "de_decimal")]
    ask: Decimal,
    #[serde(deserialize_with = "de_decimal")]
    last: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawExecution {
    exec_type: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    cl_ord_id: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    side: Option<OrderSide>,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    last_qty: Option<Decimal>,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    last_price: Option<Decimal>,
    #[serde(default)]
    order_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    #[serde(deserialize_with = "de_decimal")]
    balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecType {
    New,
    Trade,
    Filled,
    Canceled,
    Expired,
    Other(String),
}

impl ExecType {
    fn parse(s: &str) -> Self {
        match s {
            "pending_new" | "new" => Self::New,
            "trade" => Self::Trade,
            "filled" => Self::Filled,
            "canceled" => Self::Canceled,
            "expired" => Self::Expired,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One order event from the private executions channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub exec_type: ExecType,
    pub order_id: Option<String>,
    pub client_order_id: Option<ClientOrderId>,
    pub instrument: Option<InstrumentId>,
    pub side: Option<OrderSide>,
    pub last_qty: Option<Size>,
    pub last_price: Option<Price>,
    pub order_status: Option<String>,
}

impl ExecutionEvent {
    /// Price and quantity of a trade execution.
    pub fn fill(&self) -> Option<(Price, Size)> {
        if self.exec_type != ExecType::Trade {
            return None;
        }
        match (self.last_price, self.last_qty) {
            (Some(px), Some(qty)) if px.is_positive() && qty.is_positive() => Some((px, qty)),
            _ => None,
        }
    }

    /// The order left the book without (further) fills.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.exec_type, ExecType::Canceled | ExecType::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub asset: String,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Quote(Quote),
    Execution(ExecutionEvent),
    Balance(BalanceUpdate),
}

/// Stateless parser with counters.
#[derive(Debug, Default)]
pub struct MessageParser {
    parsed: AtomicU64,
    failed: AtomicU64,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every item of a channel payload. Channels without a typed
    /// representation yield nothing.
    pub fn parse(&self, data: &ChannelData) -> Vec<MarketEvent> {
        let parse_item: fn(&Value) -> FeedResult<MarketEvent> = match data.channel {
            Channel::Ticker => |v| Self::parse_ticker(v).map(MarketEvent::Quote),
            Channel::Executions => |v| Self::parse_execution(v).map(MarketEvent::Execution),
            Channel::Balances => |v| Self::parse_balance(v).map(MarketEvent::Balance),
            other => {
                debug!(channel = %other, items = data.data.len(), "No typed handler for channel");
                return Vec::new();
            }
        };

        let mut events = Vec::with_capacity(data.data.len());
        for item in &data.data {
            match parse_item(item) {
                Ok(event) => {
                    self.parsed.fetch_add(1, Ordering::Relaxed);
                    events.push(event);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %data.channel, kind = %e.kind(), error = %e, "Skipping unparseable item");
                }
            }
        }
        events
    }

    pub fn parse_ticker(item: &Value) -> FeedResult<Quote> {
        let raw = RawTicker::deserialize(item)?;
        let instrument = InstrumentId::from_str(&raw.symbol)
            .map_err(|e| FeedError::InvalidData(e.to_string()))?;
        if raw.bid.is_sign_negative() || raw.ask.is_sign_negative() || raw.last.is_sign_negative() {
            return Err(FeedError::InvalidData(format!(
                "negative price in ticker for {instrument}"
            )));
        }
        Ok(Quote::new(
            instrument,
            Price::new(raw.bid),
            Price::new(raw.ask),
            Price::new(raw.last),
        ))
    }

    pub fn parse_execution(item: &Value) -> FeedResult<ExecutionEvent> {
        let raw = RawExecution::deserialize(item)?;
        let instrument = raw
            .symbol
            .map(|s| InstrumentId::from_str(&s))
            .transpose()
            .map_err(|e| FeedError::InvalidData(e.to_string()))?;
        Ok(ExecutionEvent {
            exec_type: ExecType::parse(&raw.exec_type),
            order_id: raw.order_id,
            client_order_id: raw.cl_ord_id.map(ClientOrderId::from_string),
            instrument,
            side: raw.side,
            last_qty: raw.last_qty.map(Size::new),
            last_price: raw.last_price.map(Price::new),
            order_status: raw.order_status,
        })
    }

    pub fn parse_balance(item: &Value) -> FeedResult<BalanceUpdate> {
        let raw = RawBalance::deserialize(item)?;
        if raw.asset.is_empty() {
            return Err(FeedError::ParseError("balance without asset".to_string()));
        }
        Ok(BalanceUpdate {
            asset: raw.asset,
            balance: raw.balance,
        })
    }

    pub fn parsed_count(&self) -> u64 {
        self.parsed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sentinel_ws::UpdateKind;
    use serde_json::json;

    fn channel(channel: Channel, data: Vec<Value>) -> ChannelData {
        ChannelData {
            channel,
            kind: UpdateKind::Update,
            data,
        }
    }

    #[test]
    fn test_parse_ticker_keeps_decimal_precision() {
        let q = MessageParser::parse_ticker(&json!({
            "symbol": "XLM/USD",
            "bid": 0.2501, "bid_qty": 1200.5,
            "ask": 0.2502, "ask_qty": 800.0,
            "last": 0.25015, "volume": 1000000.0
        }))
        .unwrap();
        assert_eq!(q.instrument, InstrumentId::new("XLM/USD"));
        assert_eq!(q.bid, Price::new(dec!(0.2501)));
        assert_eq!(q.ask, Price::new(dec!(0.2502)));
        assert_eq!(q.last, Price::new(dec!(0.25015)));
    }

    #[test]
    fn test_parse_ticker_accepts_strings() {
        let q = MessageParser::parse_ticker(&json!({
            "symbol": "BTC/USD", "bid": "64000.1", "ask": "64000.2", "last": "64000.1"
        }))
        .unwrap();
        assert_eq!(q.mid(), Some(Price::new(dec!(64000.15))));
    }

    #[test]
    fn test_bad_item_skipped_rest_parsed() {
        let parser = MessageParser::new();
        let events = parser.parse(&channel(
            Channel::Ticker,
            vec![
                json!({"symbol": "XLM/USD", "bid": "oops", "ask": 0.26, "last": 0.25}),
                json!({"symbol": "XLMUSD", "bid": 0.24, "ask": 0.26, "last": 0.25}),
                json!({"symbol": "XLM/USD", "bid": 0.24, "ask": 0.26, "last": 0.25}),
            ],
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(parser.parsed_count(), 1);
        assert_eq!(parser.failed_count(), 2);
    }

    #[test]
    fn test_parse_trade_execution() {
        let parser = MessageParser::new();
        let events = parser.parse(&channel(
            Channel::Executions,
            vec![json!({
                "exec_type": "trade",
                "order_id": "OABC-123",
                "cl_ord_id": "snt_1_abcd",
                "symbol": "XLM/USD",
                "side": "buy",
                "last_qty": 40.0,
                "last_price": 0.25,
                "order_status": "filled"
            })],
        ));
        let MarketEvent::Execution(exec) = &events[0] else {
            panic!("expected execution");
        };
        assert_eq!(exec.exec_type, ExecType::Trade);
        assert_eq!(exec.client_order_id.as_ref().unwrap().as_str(), "snt_1_abcd");
        assert_eq!(
            exec.fill(),
            Some((Price::new(dec!(0.25)), Size::new(dec!(40))))
        );
        assert!(!exec.is_cancelled());
    }

    #[test]
    fn test_parse_cancel_execution() {
        let exec = MessageParser::parse_execution(&json!({
            "exec_type": "canceled",
            "order_id": "OABC-124",
            "cl_ord_id": "snt_2_ef01",
            "order_status": "canceled",
            "last_qty": null
        }))
        .unwrap();
        assert!(exec.is_cancelled());
        assert!(exec.fill().is_none());
        assert!(exec.instrument.is_none());
    }

    #[test]
    fn test_parse_balances_and_ignore_book() {
        let parser = MessageParser::new();
        let events = parser.parse(&channel(
            Channel::Balances,
            vec![json!({"asset": "USD", "balance": 1234.56, "wallets": []})],
        ));
        assert_eq!(
            events,
            vec![MarketEvent::Balance(BalanceUpdate {
                asset: "USD".to_string(),
                balance: dec!(1234.56),
            })]
        );

        assert!(parser
            .parse(&channel(Channel::Book, vec![json!({"symbol": "XLM/USD"})]))
            .is_empty());
    }
}
