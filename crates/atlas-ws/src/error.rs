//! WebSocket error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Upstream unreachable after {attempts} reconnect attempts")]
    Unreachable { attempts: u32 },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WsError {
    /// Errors that the reconnect loop treats as transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionClosed { .. }
                | Self::HeartbeatTimeout
                | Self::Tungstenite(_)
                | Self::SendFailed(_)
        )
    }
}

impl From<atlas_core::CoreError> for WsError {
    fn from(e: atlas_core::CoreError) -> Self {
        Self::SubscriptionError(e.to_string())
    }
}

pub type WsResult<T> = Result<T, WsError>;
