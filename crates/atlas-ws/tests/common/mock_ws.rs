//! Mock WebSocket server for integration tests.
//!
//! Provides a local WebSocket server that can:
//! - Accept connections and count them
//! - Echo subscription confirmations and answer pings
//! - Record received messages per connection
//! - Push frames to clients and drop every live connection on demand

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Command sent to every live connection.
#[derive(Debug, Clone)]
enum ServerCommand {
    Push(String),
    Drop,
}

/// A mock WebSocket server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    commands: broadcast::Sender<ServerCommand>,
    /// (connection index, text) in arrival order.
    messages: Arc<Mutex<Vec<(u32, String)>>>,
    connections: Arc<Mutex<u32>>,
}

impl MockWsServer {
    /// Start a new mock WebSocket server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages: Arc<Mutex<Vec<(u32, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (commands, _) = broadcast::channel(64);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let commands_clone = commands.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        let index = {
                            let mut count = connections_clone.lock().await;
                            *count += 1;
                            *count - 1
                        };
                        tokio::spawn(handle_connection(
                            stream,
                            index,
                            messages_clone.clone(),
                            commands_clone.subscribe(),
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
            commands,
            messages,
            connections,
        }
    }

    /// Get the server's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Get the number of connections accepted.
    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    /// Messages received on connection `index`.
    pub async fn messages_on(&self, index: u32) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|(conn, _)| *conn == index)
            .filter_map(|(_, text)| serde_json::from_str(text).ok())
            .collect()
    }

    /// Messages with `method` received on connection `index`.
    pub async fn requests_on(&self, index: u32, method: &str) -> Vec<serde_json::Value> {
        self.messages_on(index)
            .await
            .into_iter()
            .filter(|m| m["method"] == method)
            .collect()
    }

    /// Poll until connection `index` has received `count` requests with
    /// `method`, or the timeout elapses.
    pub async fn wait_for_requests(
        &self,
        index: u32,
        method: &str,
        count: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.requests_on(index, method).await.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Push a text frame to every live connection.
    pub fn push(&self, frame: serde_json::Value) {
        let _ = self.commands.send(ServerCommand::Push(frame.to_string()));
    }

    /// Drop every live connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(ServerCommand::Drop);
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    index: u32,
    messages: Arc<Mutex<Vec<(u32, String)>>>,
    mut commands: broadcast::Receiver<ServerCommand>,
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
            command = commands.recv() => {
                match command {
                    Ok(ServerCommand::Push(text)) => {
                        let _ = write.send(Message::Text(text)).await;
                    }
                    Ok(ServerCommand::Drop) | Err(_) => break,
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        messages.lock().await.push((index, text.clone()));

                        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
                            continue;
                        };
                        let reply = match parsed["method"].as_str() {
                            Some("subscribe") | Some("unsubscribe") => serde_json::json!({
                                "channel": "subscriptionResponse",
                                "data": parsed,
                            }),
                            Some("ping") => serde_json::json!({"channel": "pong"}),
                            _ => continue,
                        };
                        let _ = write.send(Message::Text(reply.to_string())).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}
