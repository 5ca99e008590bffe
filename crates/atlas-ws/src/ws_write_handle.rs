//! WebSocket write handle for sending messages.
//!
//! Outbound frames are queued on a channel consumed by the transport's
//! message loop, so senders never touch the socket directly and survive
//! reconnects.

use crate::connection::ConnectionState;
use crate::error::{WsError, WsResult};
use crate::message::WsRequest;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound message to be sent via WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOutbound {
    /// Plain text message (subscriptions, ping, etc.).
    Text(String),
}

/// Write handle for sending messages to WebSocket.
///
/// Frames queued while the socket is down are discarded by the transport
/// before the next subscription replay.
#[derive(Clone)]
pub struct WsWriteHandle {
    tx: mpsc::UnboundedSender<WsOutbound>,
    state: Arc<RwLock<ConnectionState>>,
}

impl WsWriteHandle {
    /// Create a new write handle.
    pub fn new(tx: mpsc::UnboundedSender<WsOutbound>, state: Arc<RwLock<ConnectionState>>) -> Self {
        Self { tx, state }
    }

    /// Queue a request for sending.
    pub fn send_request(&self, request: &WsRequest) -> WsResult<()> {
        let text = request.to_json()?;
        self.send_text(text)
    }

    /// Queue a raw text frame.
    pub fn send_text(&self, text: String) -> WsResult<()> {
        debug!(len = text.len(), "Queueing outbound frame");
        self.tx
            .send(WsOutbound::Text(text))
            .map_err(|_| WsError::SendFailed("outbound channel closed".to_string()))
    }

    /// Check if the transport is currently connected.
    pub fn is_connected(&self) -> bool {
        *self.state.read() == ConnectionState::Connected
    }
}

impl std::fmt::Debug for WsWriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsWriteHandle")
            .field("state", &*self.state.read())
            .finish()
    }
}
