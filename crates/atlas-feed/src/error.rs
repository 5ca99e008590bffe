//! Feed error types.

use thiserror::Error;

/// Decode failures of market-data payloads. They stay at the decode site:
/// the frame is skipped and the stream goes on.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Malformed {channel} payload: {reason}")]
    Payload {
        channel: &'static str,
        reason: String,
    },

    #[error("{0} payload without coin")]
    MissingCoin(&'static str),

    #[error("Malformed book level: {0}")]
    MalformedLevel(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(String),
}

impl FeedError {
    pub fn payload(channel: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Payload {
            channel,
            reason: reason.to_string(),
        }
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
