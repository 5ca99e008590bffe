//! Strategy rows and lifecycle states.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a strategy.
///
/// `COOLDOWN → IDLE` closes the loop; there is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyState {
    #[default]
    Idle,
    Setup,
    Triggered,
    Ordering,
    InPosition,
    Exiting,
    Cooldown,
}

impl StrategyState {
    pub const ALL: [StrategyState; 7] = [
        Self::Idle,
        Self::Setup,
        Self::Triggered,
        Self::Ordering,
        Self::InPosition,
        Self::Exiting,
        Self::Cooldown,
    ];

    /// States reachable from `self` in one step.
    pub fn allowed_transitions(&self) -> &'static [StrategyState] {
        use StrategyState::*;
        match self {
            Idle => &[Setup],
            Setup => &[Triggered, Idle],
            Triggered => &[Ordering, Idle],
            Ordering => &[InPosition, Idle],
            InPosition => &[Exiting],
            Exiting => &[Cooldown, InPosition],
            Cooldown => &[Idle],
        }
    }

    pub fn can_transition_to(&self, next: StrategyState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Setup => "SETUP",
            Self::Triggered => "TRIGGERED",
            Self::Ordering => "ORDERING",
            Self::InPosition => "IN_POSITION",
            Self::Exiting => "EXITING",
            Self::Cooldown => "COOLDOWN",
        }
    }
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution mode of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    #[default]
    Paper,
    Live,
    Disabled,
}

impl fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Per-strategy risk limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyLimits {
    pub max_daily_loss_usd: Decimal,
    pub max_trades_per_day: u32,
    pub max_position_usd: Decimal,
    pub cooldown_minutes: u32,
}

impl Default for StrategyLimits {
    fn default() -> Self {
        Self {
            max_daily_loss_usd: Decimal::from(500),
            max_trades_per_day: 10,
            max_position_usd: Decimal::from(1000),
            cooldown_minutes: 15,
        }
    }
}

/// Strategy row. `current_state` only changes through the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub account: String,
    pub symbol: String,
    pub mode: StrategyMode,
    pub current_state: StrategyState,
    pub state_updated_at: DateTime<Utc>,
    pub config_version: u32,
    pub limits: StrategyLimits,
    #[serde(default)]
    pub state_metadata: serde_json::Value,
}

impl Strategy {
    pub fn new(
        id: impl Into<String>,
        account: impl Into<String>,
        symbol: impl Into<String>,
        mode: StrategyMode,
        limits: StrategyLimits,
    ) -> Self {
        Self {
            id: id.into(),
            account: account.into(),
            symbol: symbol.into().to_ascii_uppercase(),
            mode,
            current_state: StrategyState::Idle,
            state_updated_at: Utc::now(),
            config_version: 1,
            limits,
            state_metadata: serde_json::Value::Null,
        }
    }

    pub fn is_paper(&self) -> bool {
        self.mode == StrategyMode::Paper
    }

    pub fn is_disabled(&self) -> bool {
        self.mode == StrategyMode::Disabled
    }
}
