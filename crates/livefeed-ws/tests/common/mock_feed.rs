//! Mock trade feed server for integration tests.
//!
//! Speaks the feed protocol:
//! - Greets every connection with a `connected` status frame
//! - Acknowledges `auth` with the authenticated status frame
//! - Answers each `subscribe` channel with one trade tick
//! - Records every text frame received

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const TICK_PRICE: f64 = 65000.12;

pub struct MockFeedServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicU32>,
}

impl MockFeedServer {
    /// Start a server on an available port.
    ///
    /// With `drop_first_session`, the first connection is dropped right
    /// after it authenticates.
    pub async fn start(drop_first_session: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicU32::new(0));
        let drop_pending = Arc::new(AtomicBool::new(drop_first_session));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        connections_clone.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(handle_connection(
                            stream,
                            messages_clone.clone(),
                            drop_pending.clone(),
                        ));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            messages,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Received frames decoded as JSON.
    pub async fn received(&self) -> Vec<Value> {
        self.messages
            .lock()
            .await
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect()
    }

    /// Received frames with the given `action`.
    pub async fn received_action(&self, action: &str) -> Vec<Value> {
        self.received()
            .await
            .into_iter()
            .filter(|m| m["action"] == action)
            .collect()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    messages: Arc<Mutex<Vec<String>>>,
    drop_pending: Arc<AtomicBool>,
) {
    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();

    let greeting = json!([{"ev": "status", "status": "connected", "message": "Connected Successfully"}]);
    if write.send(Message::Text(greeting.to_string())).await.is_err() {
        return;
    }

    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        messages.lock().await.push(text.clone());

        let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match parsed["action"].as_str() {
            Some("auth") => {
                let ack = json!([{"ev": "status", "status": "success", "message": "authenticated"}]);
                let _ = write.send(Message::Text(ack.to_string())).await;
                if drop_pending.swap(false, Ordering::SeqCst) {
                    // Abrupt drop: no close frame
                    return;
                }
            }
            Some("subscribe") => {
                let params = parsed["params"].as_str().unwrap_or_default();
                let ticks: Vec<Value> = params
                    .split(',')
                    .filter_map(|channel| channel.split_once('.'))
                    .map(|(_, symbol)| json!({"ev": "XT", "pair": format!("{symbol} "), "p": TICK_PRICE}))
                    .collect();
                let _ = write.send(Message::Text(Value::Array(ticks).to_string())).await;
            }
            _ => {}
        }
    }
}
