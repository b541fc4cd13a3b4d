//! Mock WebSocket server for integration tests.
//!
//! Provides a simple WebSocket server that can:
//! - Accept connections and count them
//! - Acknowledge subscribe/unsubscribe requests (optionally rejecting channels)
//! - Answer application pings, or stay silent to exercise the watchdog
//! - Push arbitrary frames to every connected client
//! - Record received messages

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Reply to `{"method":"ping"}` with a pong.
    pub answer_pings: bool,
    /// Channels whose subscribe requests are answered with `success: false`.
    pub reject_channels: Vec<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            answer_pings: true,
            reject_channels: Vec::new(),
        }
    }
}

/// A mock WebSocket server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    push_tx: broadcast::Sender<String>,
    messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicU32>,
}

impl MockWsServer {
    pub async fn start() -> Self {
        Self::start_with(MockBehavior::default()).await
    }

    /// Start a new mock WebSocket server on an available port.
    pub async fn start_with(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (push_tx, _) = broadcast::channel::<String>(64);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let push_clone = push_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        connections_clone.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(handle_connection(
                            stream,
                            behavior.clone(),
                            messages_clone.clone(),
                            push_clone.subscribe(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            push_tx,
            messages,
            connections,
        }
    }

    /// Get the server's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Get all received messages.
    pub async fn received_messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }

    /// Received requests with the given method, parsed.
    pub async fn requests(&self, method: &str) -> Vec<Value> {
        self.received_messages()
            .await
            .iter()
            .filter_map(|m| serde_json::from_str::<Value>(m).ok())
            .filter(|v| v.get("method").and_then(Value::as_str) == Some(method))
            .collect()
    }

    /// Send a text frame to every connected client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.push_tx.send(text.into());
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

fn ack_for(request: &Value, behavior: &MockBehavior) -> Value {
    let method = request.get("method").cloned().unwrap_or(Value::Null);
    let req_id = request.get("req_id").cloned().unwrap_or(Value::Null);
    let channel = request
        .pointer("/params/channel")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if behavior.reject_channels.contains(&channel) {
        return json!({
            "method": method,
            "success": false,
            "error": "EGeneral:Permission denied",
            "req_id": req_id,
        });
    }
    json!({
        "method": method,
        "result": {"channel": channel},
        "success": true,
        "req_id": req_id,
    })
}

async fn handle_connection(
    stream: TcpStream,
    behavior: MockBehavior,
    messages: Arc<Mutex<Vec<String>>>,
    mut push_rx: broadcast::Receiver<String>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    messages.lock().await.push(text.clone());

                    let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let reply = match parsed.get("method").and_then(Value::as_str) {
                        Some("subscribe") | Some("unsubscribe") => Some(ack_for(&parsed, &behavior)),
                        Some("ping") if behavior.answer_pings => Some(json!({
                            "method": "pong",
                            "req_id": parsed.get("req_id").cloned().unwrap_or(Value::Null),
                        })),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        let _ = write.send(Message::Text(reply.to_string())).await;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            pushed = push_rx.recv() => match pushed {
                Ok(text) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
