//! WebSocket stream transport.
//!
//! Handles connection lifecycle, automatic reconnection with capped
//! exponential backoff, keepalive, and subscription replay after
//! reconnection. Decoded frames are routed through the
//! `SubscriptionRegistry`.

use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatManager;
use crate::message::{route_frame, WsMessage, WsRequest};
use crate::subscription::SubscriptionRegistry;
use crate::ws_write_handle::{WsOutbound, WsWriteHandle};
use atlas_telemetry::Metrics;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    pub url: String,
    /// Maximum consecutive reconnection attempts (0 = infinite).
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    pub reconnect_jitter_ms: u64,
    /// Keepalive ping interval.
    pub ping_interval_ms: u64,
    /// Pong must arrive within this after a ping (0 = not enforced).
    pub pong_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30000,
            reconnect_jitter_ms: 1000,
            ping_interval_ms: 30000,
            pong_timeout_ms: 60000,
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

/// Lifecycle notifications published to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { replayed: usize },
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Terminal: reconnect attempts are exhausted.
    Unreachable { attempts: u32 },
}

/// Multiplexed WebSocket transport.
pub struct StreamTransport {
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    registry: Arc<SubscriptionRegistry>,
    heartbeat: Arc<HeartbeatManager>,
    reconnect_count: Arc<RwLock<u32>>,
    outbound_tx: mpsc::UnboundedSender<WsOutbound>,
    /// Consumed by the message loop of the live session.
    outbound_rx: TokioMutex<mpsc::UnboundedReceiver<WsOutbound>>,
    /// Cancelled by `disconnect()`; no reconnect happens afterwards.
    shutdown_token: CancellationToken,
    events: broadcast::Sender<TransportEvent>,
}

impl StreamTransport {
    /// Create a transport and attach it to `registry`.
    pub fn new(config: ConnectionConfig, registry: Arc<SubscriptionRegistry>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        registry.attach(WsWriteHandle::new(outbound_tx.clone(), state.clone()));

        Self {
            heartbeat: Arc::new(HeartbeatManager::new(
                config.ping_interval_ms,
                config.pong_timeout_ms,
            )),
            config,
            state,
            registry,
            reconnect_count: Arc::new(RwLock::new(0)),
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            shutdown_token: CancellationToken::new(),
            events,
        }
    }

    /// Get a write handle for sending raw frames.
    pub fn write_handle(&self) -> WsWriteHandle {
        WsWriteHandle::new(self.outbound_tx.clone(), self.state.clone())
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Get current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn reconnect_count(&self) -> u32 {
        *self.reconnect_count.read()
    }

    /// Terminal, user-requested shutdown.
    ///
    /// Cancels the shutdown token: the live session sends a Close frame and
    /// the reconnect loop exits instead of scheduling another attempt.
    pub fn disconnect(&self) {
        info!("StreamTransport disconnect requested");
        self.shutdown_token.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Connect and run the message loop, reconnecting on unexpected closure.
    ///
    /// Returns `Ok(())` after `disconnect()`, or `WsError::Unreachable` once
    /// the reconnect attempts are exhausted.
    pub async fn connect(&self) -> WsResult<()> {
        self.connect_with_retry().await
    }

    fn publish(&self, event: TransportEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    async fn connect_with_retry(&self) -> WsResult<()> {
        let mut attempt = 0u32;

        loop {
            if self.is_shutdown() {
                info!("Shutdown requested, exiting connect loop");
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);

            let mut established = false;
            let reason = match self.run_session(&mut established).await {
                Ok(()) => "closed".to_string(),
                Err(e) => {
                    warn!(error = %e, "WebSocket session ended with error");
                    e.to_string()
                }
            };

            self.registry.on_disconnected();

            if self.is_shutdown() {
                info!("Shutdown requested after disconnect, not reconnecting");
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            if established {
                attempt = 0;
                self.publish(TransportEvent::Disconnected {
                    reason: reason.clone(),
                });
            }

            attempt += 1;
            *self.reconnect_count.write() = attempt;

            if self.config.max_reconnect_attempts > 0 && attempt > self.config.max_reconnect_attempts
            {
                let attempts = self.config.max_reconnect_attempts;
                error!(attempts, %reason, "Max reconnection attempts reached");
                self.set_state(ConnectionState::Disconnected);
                self.publish(TransportEvent::Unreachable { attempts });
                return Err(WsError::Unreachable { attempts });
            }

            self.set_state(ConnectionState::Reconnecting);

            let delay = self.calculate_backoff_delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            self.publish(TransportEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown requested during backoff, exiting");
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    /// One connection from handshake to closure.
    async fn run_session(&self, established: &mut bool) -> WsResult<()> {
        info!(url = %self.config.url, "Connecting to WebSocket");

        let connect = connect_async_tls_with_config(&self.config.url, None, true, None);
        let (ws_stream, _response) = tokio::select! {
            result = connect => result.map_err(|e| WsError::ConnectionFailed(e.to_string()))?,
            () = self.shutdown_token.cancelled() => return Ok(()),
        };
        let (mut write, mut read) = ws_stream.split();

        // Held for the whole session; only one session runs at a time.
        let mut outbound_rx = self.outbound_rx.lock().await;

        // Frames queued for the dead connection are stale: the replay below
        // re-sends every live subscription.
        let mut discarded = 0usize;
        while outbound_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Discarded stale outbound frames");
        }

        self.set_state(ConnectionState::Connected);
        *self.reconnect_count.write() = 0;
        *established = true;
        self.heartbeat.reset();

        let replayed = self.registry.on_connected();
        info!(replayed, "WebSocket connected, subscriptions replayed");
        self.publish(TransportEvent::Connected { replayed });

        let mut keepalive = tokio::time::interval(self.heartbeat.interval());
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        keepalive.tick().await;

        loop {
            tokio::select! {
                biased;

                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received in message loop");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(?e, "Failed to send Close frame during shutdown");
                    }
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text_message(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!("Received ping, sending pong");
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.heartbeat.record_pong();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "WebSocket closed by server");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => {
                            error!(?e, "WebSocket read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            return Err(WsError::ConnectionClosed {
                                code: 1006,
                                reason: "Stream ended".to_string(),
                            });
                        }
                        _ => {}
                    }
                }

                outbound = outbound_rx.recv() => {
                    if let Some(WsOutbound::Text(text)) = outbound {
                        write.send(Message::Text(text)).await?;
                    }
                }

                _ = keepalive.tick() => {
                    if self.heartbeat.is_timed_out() {
                        error!("Pong timeout");
                        return Err(WsError::HeartbeatTimeout);
                    }
                    let ping = WsRequest::ping().to_json()?;
                    write.send(Message::Text(ping)).await?;
                    self.heartbeat.record_ping();
                }
            }
        }
    }

    /// Decode and route one text frame. Never fails the session.
    fn handle_text_message(&self, text: &str) {
        let msg: WsMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, len = text.len(), "Dropping undecodable frame");
                return;
            }
        };

        let channel_msg = match msg {
            WsMessage::Pong(pong) => {
                if pong.is_pong() {
                    self.heartbeat.record_pong();
                }
                return;
            }
            WsMessage::Channel(channel_msg) => channel_msg,
        };

        match channel_msg.channel.as_str() {
            "pong" => {
                self.heartbeat.record_pong();
                return;
            }
            "subscriptionResponse" => {
                debug!(data = %channel_msg.data, "Received subscription response");
                return;
            }
            "error" => {
                warn!(data = %channel_msg.data, "Received error channel message");
                return;
            }
            _ => {}
        }

        let channel = channel_msg.channel.clone();
        let Some(frame) = route_frame(channel_msg) else {
            debug!(%channel, "Dropping unroutable frame");
            Metrics::frame_dropped("unroutable");
            return;
        };

        let outcome = self.registry.dispatch(&frame);
        if outcome.is_unrouted() {
            debug!(key = %frame.key, "No handlers for frame");
            Metrics::frame_dropped("no_handler");
        }
    }

    /// `min(base * 2^(attempt-1), cap)` plus jitter.
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            attempt,
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
            rand_jitter(self.config.reconnect_jitter_ms),
        )
    }
}

/// Capped exponential backoff. `attempt` starts at 1.
fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64, jitter_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    Duration::from_millis(delay + jitter_ms)
}

/// Generate random jitter in `0..=max_ms`.
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos as u64 % (max_ms + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_enforces_pong_timeout() {
        let config = ConnectionConfig::default();
        assert!(config.pong_timeout_ms > 0);
        assert!(config.max_reconnect_attempts > 0);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        assert_eq!(backoff_delay(1, 100, 1000, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, 100, 1000, 0), Duration::from_millis(200));
        assert_eq!(backoff_delay(4, 100, 1000, 0), Duration::from_millis(800));
        assert_eq!(backoff_delay(5, 100, 1000, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(60, 100, 1000, 0), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_is_bounded() {
        for _ in 0..100 {
            assert!(rand_jitter(250) <= 250);
        }
        assert_eq!(rand_jitter(0), 0);
    }

    #[test]
    fn test_new_transport_attaches_registry() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let transport = StreamTransport::new(ConnectionConfig::default(), registry.clone());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!registry.is_connected());
        assert!(!transport.write_handle().is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_after_max_attempts() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let config = ConnectionConfig {
            // Nothing listens on port 9 of localhost in the test environment.
            url: "ws://127.0.0.1:9".to_string(),
            max_reconnect_attempts: 2,
            reconnect_base_delay_ms: 1,
            reconnect_max_delay_ms: 5,
            reconnect_jitter_ms: 0,
            ..Default::default()
        };
        let transport = StreamTransport::new(config, registry);
        let mut events = transport.events();

        let result = transport.connect().await;
        assert!(matches!(result, Err(WsError::Unreachable { attempts: 2 })));

        let mut saw_unreachable = false;
        while let Ok(event) = events.try_recv() {
            if event == (TransportEvent::Unreachable { attempts: 2 }) {
                saw_unreachable = true;
            }
        }
        assert!(saw_unreachable);
    }
}
