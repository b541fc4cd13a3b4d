//! Minimal exchange stand-in for engine tests.
//!
//! Accepts any number of sessions, acknowledges every subscribe request and
//! broadcasts pushed frames to all connected clients.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub struct MockExchange {
    addr: SocketAddr,
    push_tx: broadcast::Sender<String>,
    accept_task: JoinHandle<()>,
}

impl MockExchange {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (push_tx, _) = broadcast::channel::<String>(256);

        let sessions = push_tx.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, sessions.subscribe()));
            }
        });

        Self {
            addr,
            push_tx,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Broadcast a raw text frame.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.push_tx.send(text.into());
    }

    /// Broadcast a ticker update for one symbol.
    pub fn push_ticker(&self, symbol: &str, bid: f64, ask: f64) {
        self.push(
            json!({
                "channel": "ticker",
                "type": "update",
                "data": [{"symbol": symbol, "bid": bid, "ask": ask, "last": bid}]
            })
            .to_string(),
        );
    }
}

impl Drop for MockExchange {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(stream: TcpStream, mut pushed: broadcast::Receiver<String>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            inbound = read.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    _ => break,
                };
                let Ok(request) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let req_id = request.get("req_id").cloned().unwrap_or(Value::Null);
                let reply = match request.get("method").and_then(Value::as_str) {
                    Some(method @ ("subscribe" | "unsubscribe")) => json!({
                        "method": method,
                        "result": {"channel": request.pointer("/params/channel").cloned().unwrap_or(Value::Null)},
                        "success": true,
                        "req_id": req_id,
                    }),
                    Some("ping") => json!({"method": "pong", "req_id": req_id}),
                    _ => continue,
                };
                if write.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
            }
            frame = pushed.recv() => match frame {
                Ok(text) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
