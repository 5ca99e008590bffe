//! WebSocket message types and inbound frame routing.

use atlas_core::{ChannelKey, ChannelType, SubscriptionSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Core WebSocket Messages
// ============================================================================

/// Incoming WebSocket message wrapper.
///
/// Every inbound frame is channel-based. The `channel` field determines the
/// message type:
/// - "pong": Keepalive reply
/// - "subscriptionResponse": Subscription acknowledgement (not dispatched)
/// - "error": Venue-side error report
/// - anything else: Market-data or user-data payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WsMessage {
    /// Pong response (no data field, just channel: "pong").
    Pong(PongMessage),
    /// Channel-based message (all other messages with data field).
    Channel(ChannelMessage),
}

impl WsMessage {
    /// Check if this is a pong message.
    pub fn is_pong(&self) -> bool {
        matches!(self, Self::Pong(p) if p.is_pong())
    }

    /// Get the channel name.
    pub fn channel(&self) -> &str {
        match self {
            Self::Pong(p) => &p.channel,
            Self::Channel(c) => &c.channel,
        }
    }
}

/// Channel-based message from a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Channel identifier (e.g., "l2Book", "candle", "subscriptionResponse").
    pub channel: String,
    /// Message data (flexible JSON).
    #[serde(default)]
    pub data: Value,
}

/// Pong response message (format: {"channel": "pong"}).
/// Uses deny_unknown_fields to distinguish from ChannelMessage in untagged enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PongMessage {
    pub channel: String,
}

impl PongMessage {
    pub fn is_pong(&self) -> bool {
        self.channel == "pong"
    }
}

/// Outgoing request to WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionSpec>,
}

impl WsRequest {
    /// Create a ping request.
    pub fn ping() -> Self {
        Self {
            method: "ping".to_string(),
            subscription: None,
        }
    }

    /// Create a subscribe request.
    pub fn subscribe(spec: &SubscriptionSpec) -> Self {
        Self {
            method: "subscribe".to_string(),
            subscription: Some(spec.clone()),
        }
    }

    /// Create an unsubscribe request.
    pub fn unsubscribe(spec: &SubscriptionSpec) -> Self {
        Self {
            method: "unsubscribe".to_string(),
            subscription: Some(spec.clone()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Routing
// ============================================================================

/// A decoded inbound frame with its routing keys resolved.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub channel_type: ChannelType,
    /// Exact channel key derived from the frame contents.
    pub key: ChannelKey,
    pub coin: Option<String>,
    pub user: Option<String>,
    pub data: Value,
}

impl StreamFrame {
    /// Secondary `type:COIN` key, when it differs from the exact key.
    pub fn fallback_key(&self) -> Option<ChannelKey> {
        if !self.channel_type.requires_coin() {
            return None;
        }
        let coin = self.coin.as_deref()?;
        let fallback = ChannelKey::coin_scoped(self.channel_type, coin);
        (fallback != self.key).then_some(fallback)
    }
}

fn str_field<'a>(data: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| data.get(*name).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// First object of an array payload, or the payload itself.
fn head(data: &Value) -> &Value {
    match data {
        Value::Array(items) => items.first().unwrap_or(data),
        other => other,
    }
}

/// Resolve the routing key of a channel message.
///
/// The key is derived from the channel type plus the coin, the candle
/// interval and the user address found in the payload. Returns `None`
/// for frames that cannot be routed (unknown channel, missing coin on a
/// coin-scoped channel).
pub fn route_frame(msg: ChannelMessage) -> Option<StreamFrame> {
    // Some venues suffix the channel with the coin ("bbo:BTC").
    let mut parts = msg.channel.splitn(2, ':');
    let channel_type: ChannelType = parts.next()?.parse().ok()?;
    let channel_suffix = parts.next().filter(|s| !s.is_empty());

    let payload = head(&msg.data);
    let nested_order = payload.get("order").unwrap_or(&Value::Null);

    let coin = str_field(payload, &["coin", "s"])
        .or_else(|| str_field(nested_order, &["coin"]))
        .or(if channel_type.requires_coin() {
            channel_suffix
        } else {
            None
        })
        .map(str::to_ascii_uppercase);

    if channel_type.requires_coin() && coin.is_none() {
        return None;
    }

    let interval = if channel_type.requires_interval() {
        str_field(payload, &["i", "interval"])
    } else {
        None
    };

    let user = if channel_type.requires_user() {
        str_field(&msg.data, &["user"])
            .or(channel_suffix)
            .map(str::to_ascii_lowercase)
    } else {
        None
    };

    let key_coin = if channel_type.requires_coin() {
        coin.as_deref()
    } else {
        None
    };
    let key = ChannelKey::build(channel_type, key_coin, interval, user.as_deref());

    Some(StreamFrame {
        channel_type,
        key,
        coin,
        user,
        data: msg.data,
    })
}
