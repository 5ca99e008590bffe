//! Market-data WebSocket transport for the Atlas engine.
//!
//! Provides one physical connection carrying many logical subscriptions:
//! - Automatic reconnection with capped exponential backoff and jitter
//! - Ref-counted subscriptions replayed exactly once per reconnect
//! - Keepalive pings with optional pong-timeout enforcement
//! - Channel-key routing of inbound frames to registered handlers

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod subscription;
pub mod ws_write_handle;

pub use connection::{ConnectionConfig, ConnectionState, StreamTransport, TransportEvent};
pub use error::{WsError, WsResult};
pub use heartbeat::HeartbeatManager;
pub use message::{route_frame, ChannelMessage, PongMessage, StreamFrame, WsMessage, WsRequest};
pub use subscription::{
    DispatchOutcome, FrameHandler, HandlerError, SubscriptionRegistry, SubscriptionToken,
};
pub use ws_write_handle::{WsOutbound, WsWriteHandle};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket or HTTPS connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
