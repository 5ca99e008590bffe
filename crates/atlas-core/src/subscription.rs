//! Market-data subscription identity.
//!
//! A subscription is identified by its canonical channel key, never by
//! object identity: `type[:COIN][:interval][:user]` with coins uppercased
//! and user addresses lowercased.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Channel types understood by the market-data venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelType {
    AllMids,
    L2Book,
    Trades,
    Candle,
    Bbo,
    ActiveAssetCtx,
    UserFills,
    OrderUpdates,
    UserEvents,
    WebData2,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllMids => "allMids",
            Self::L2Book => "l2Book",
            Self::Trades => "trades",
            Self::Candle => "candle",
            Self::Bbo => "bbo",
            Self::ActiveAssetCtx => "activeAssetCtx",
            Self::UserFills => "userFills",
            Self::OrderUpdates => "orderUpdates",
            Self::UserEvents => "userEvents",
            Self::WebData2 => "webData2",
        }
    }

    /// Channel is scoped to one coin.
    pub fn requires_coin(&self) -> bool {
        matches!(
            self,
            Self::L2Book | Self::Trades | Self::Candle | Self::Bbo | Self::ActiveAssetCtx
        )
    }

    /// Channel is scoped to one user address.
    pub fn requires_user(&self) -> bool {
        matches!(
            self,
            Self::UserFills | Self::OrderUpdates | Self::UserEvents | Self::WebData2
        )
    }

    pub fn requires_interval(&self) -> bool {
        matches!(self, Self::Candle)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allMids" => Ok(Self::AllMids),
            "l2Book" => Ok(Self::L2Book),
            "trades" => Ok(Self::Trades),
            "candle" => Ok(Self::Candle),
            "bbo" => Ok(Self::Bbo),
            "activeAssetCtx" => Ok(Self::ActiveAssetCtx),
            "userFills" => Ok(Self::UserFills),
            "orderUpdates" => Ok(Self::OrderUpdates),
            "userEvents" => Ok(Self::UserEvents),
            "webData2" => Ok(Self::WebData2),
            other => Err(CoreError::UnknownChannel(other.to_string())),
        }
    }
}

/// Canonical channel key used for routing and ref-counting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Build a key from its parts, applying case normalization.
    pub fn build(
        channel_type: ChannelType,
        coin: Option<&str>,
        interval: Option<&str>,
        user: Option<&str>,
    ) -> Self {
        let mut key = channel_type.as_str().to_string();
        if let Some(coin) = coin.filter(|c| !c.is_empty()) {
            key.push(':');
            key.push_str(&coin.to_ascii_uppercase());
        }
        if let Some(interval) = interval.filter(|i| !i.is_empty()) {
            key.push(':');
            key.push_str(interval);
        }
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            key.push(':');
            key.push_str(&user.to_ascii_lowercase());
        }
        Self(key)
    }

    /// Coin-qualified key (`type:COIN`), the secondary dispatch target.
    pub fn coin_scoped(channel_type: ChannelType, coin: &str) -> Self {
        Self::build(channel_type, Some(coin), None, None)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel type prefix of the key.
    pub fn channel_type(&self) -> Option<ChannelType> {
        self.0.split(':').next().and_then(|t| t.parse().ok())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A logical subscription. Serializes directly to the wire
/// `subscription` object: `{"type", "coin"?, "interval"?, "user"?}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub coin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
}

impl SubscriptionSpec {
    fn bare(channel_type: ChannelType) -> Self {
        Self {
            channel_type,
            coin: None,
            interval: None,
            user: None,
        }
    }

    pub fn all_mids() -> Self {
        Self::bare(ChannelType::AllMids)
    }

    /// Coin-scoped channel (`l2Book`, `trades`, `bbo`, `activeAssetCtx`).
    pub fn coin(channel_type: ChannelType, coin: impl Into<String>) -> Self {
        Self {
            coin: Some(coin.into().to_ascii_uppercase()),
            ..Self::bare(channel_type)
        }
    }

    pub fn l2_book(coin: impl Into<String>) -> Self {
        Self::coin(ChannelType::L2Book, coin)
    }

    pub fn candle(coin: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            coin: Some(coin.into().to_ascii_uppercase()),
            interval: Some(interval.into()),
            ..Self::bare(ChannelType::Candle)
        }
    }

    /// User-scoped channel (`userFills`, `orderUpdates`, `userEvents`, `webData2`).
    pub fn user(channel_type: ChannelType, user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into().to_ascii_lowercase()),
            ..Self::bare(channel_type)
        }
    }

    /// Check that the parameters required by the channel type are present.
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            CoreError::InvalidSubscription(format!("{} requires {field}", self.channel_type))
        };
        if self.channel_type.requires_coin() && self.coin.as_deref().unwrap_or("").is_empty() {
            return Err(missing("coin"));
        }
        if self.channel_type.requires_interval()
            && self.interval.as_deref().unwrap_or("").is_empty()
        {
            return Err(missing("interval"));
        }
        if self.channel_type.requires_user() && self.user.as_deref().unwrap_or("").is_empty() {
            return Err(missing("user"));
        }
        Ok(())
    }

    /// Canonical channel key.
    pub fn key(&self) -> ChannelKey {
        ChannelKey::build(
            self.channel_type,
            self.coin.as_deref(),
            self.interval.as_deref(),
            self.user.as_deref(),
        )
    }
}

impl fmt::Display for SubscriptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
