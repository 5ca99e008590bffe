//! Risk bookkeeping rows and reason codes.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a risk event. Ordered `Info < Warning < Critical < Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Reason code attached to a risk denial or audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskCode {
    KillSwitchActive,
    CooldownActive,
    DailyLossExceeded,
    MaxTradesExceeded,
    PositionSizeExceeded,
    /// Audit-only: an order fell back to a paper fill.
    PaperFallback,
}

impl RiskCode {
    /// Severity a denial with this code carries.
    pub fn severity(&self) -> Severity {
        match self {
            Self::KillSwitchActive => Severity::Fatal,
            Self::CooldownActive => Severity::Info,
            Self::DailyLossExceeded => Severity::Critical,
            Self::MaxTradesExceeded => Severity::Warning,
            Self::PositionSizeExceeded => Severity::Warning,
            Self::PaperFallback => Severity::Warning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KillSwitchActive => "KILL_SWITCH_ACTIVE",
            Self::CooldownActive => "COOLDOWN_ACTIVE",
            Self::DailyLossExceeded => "DAILY_LOSS_EXCEEDED",
            Self::MaxTradesExceeded => "MAX_TRADES_EXCEEDED",
            Self::PositionSizeExceeded => "POSITION_SIZE_EXCEEDED",
            Self::PaperFallback => "PAPER_FALLBACK",
        }
    }
}

impl fmt::Display for RiskCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk counters for one account and one UTC trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub account: String,
    pub trading_day: NaiveDate,
    /// Accumulated realized loss, stored as a positive magnitude.
    pub daily_loss_usd: Decimal,
    pub daily_trade_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RiskState {
    /// Row key: `{account}:{YYYY-MM-DD}`.
    pub fn key(account: &str, trading_day: NaiveDate) -> String {
        format!("{account}:{}", trading_day.format("%Y-%m-%d"))
    }

    /// Empty row for a new trading day.
    pub fn fresh(account: impl Into<String>, trading_day: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            account: account.into(),
            trading_day,
            daily_loss_usd: Decimal::ZERO,
            daily_trade_count: 0,
            cooldown_until: None,
            kill_switch_active: false,
            kill_switch_reason: None,
            updated_at: now,
        }
    }

    /// New day row that keeps the kill switch and any unexpired cooldown
    /// from the previous day. Counters start at zero.
    pub fn carry_over(previous: &RiskState, trading_day: NaiveDate, now: DateTime<Utc>) -> Self {
        let mut next = Self::fresh(previous.account.clone(), trading_day, now);
        next.kill_switch_active = previous.kill_switch_active;
        next.kill_switch_reason = previous.kill_switch_reason.clone();
        next.cooldown_until = previous.cooldown_until.filter(|until| *until > now);
        next
    }

    pub fn row_key(&self) -> String {
        Self::key(&self.account, self.trading_day)
    }

    pub fn cooldown_active(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| until > now).unwrap_or(false)
    }
}

/// Audit row for a risk decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: String,
    pub account: String,
    pub code: RiskCode,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl RiskEvent {
    pub fn new(
        account: impl Into<String>,
        code: RiskCode,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: crate::order::new_row_id(),
            account: account.into(),
            code,
            severity: code.severity(),
            message: message.into(),
            created_at,
        }
    }

    /// Whether this event should replace `displayed`.
    ///
    /// A strictly more severe event always wins. An event of equal severity
    /// replaces the displayed one only if it is not older.
    pub fn supersedes(&self, displayed: &RiskEvent) -> bool {
        match self.severity.cmp(&displayed.severity) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.created_at >= displayed.created_at,
            std::cmp::Ordering::Less => false,
        }
    }
}
