//! Pre-trade risk gate.
//!
//! Checks run in a fixed order and the first block wins:
//!
//! 1. Kill switch active
//! 2. Cooldown not yet expired
//! 3. Daily loss at or above the limit
//! 4. Daily trade count at or above the limit
//! 5. Requested notional above the position limit
//!
//! The gate is pure: it reads the day's `RiskState` and the strategy
//! limits and never mutates anything.

use atlas_core::{RiskCode, RiskState, Severity, StrategyLimits};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Reason a trade was blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskDenial {
    pub code: RiskCode,
    pub severity: Severity,
    pub message: String,
}

impl RiskDenial {
    fn new(code: RiskCode, message: String) -> Self {
        Self {
            code,
            severity: code.severity(),
            message,
        }
    }
}

/// Result of a single gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateResult {
    Pass,
    Block(RiskDenial),
}

/// Overall gate decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskDecision {
    Approve,
    Deny(RiskDenial),
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve)
    }

    pub fn denial(&self) -> Option<&RiskDenial> {
        match self {
            Self::Approve => None,
            Self::Deny(d) => Some(d),
        }
    }
}

/// Risk gate over the account's daily state and the strategy limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskGate;

impl RiskGate {
    pub fn new() -> Self {
        Self
    }

    /// First failing check, or `Approve`.
    pub fn evaluate(
        &self,
        state: &RiskState,
        limits: &StrategyLimits,
        notional_usd: Decimal,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        match self.assess(state, limits, notional_usd, now).into_iter().next() {
            Some(denial) => {
                debug!(
                    account = %state.account,
                    code = %denial.code.as_str(),
                    reason = %denial.message,
                    "Risk gate blocked"
                );
                RiskDecision::Deny(denial)
            }
            None => {
                trace!(account = %state.account, %notional_usd, "Risk gate approved");
                RiskDecision::Approve
            }
        }
    }

    /// Every failing check, in gate order.
    pub fn assess(
        &self,
        state: &RiskState,
        limits: &StrategyLimits,
        notional_usd: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<RiskDenial> {
        [
            self.check_kill_switch(state),
            self.check_cooldown(state, now),
            self.check_daily_loss(state, limits),
            self.check_trade_count(state, limits),
            self.check_position_size(limits, notional_usd),
        ]
        .into_iter()
        .filter_map(|gate| match gate {
            GateResult::Pass => None,
            GateResult::Block(denial) => Some(denial),
        })
        .collect()
    }

    pub fn check_kill_switch(&self, state: &RiskState) -> GateResult {
        if !state.kill_switch_active {
            return GateResult::Pass;
        }
        let reason = state
            .kill_switch_reason
            .as_deref()
            .unwrap_or("no reason recorded");
        GateResult::Block(RiskDenial::new(
            RiskCode::KillSwitchActive,
            format!("Kill switch active: {reason}"),
        ))
    }

    pub fn check_cooldown(&self, state: &RiskState, now: DateTime<Utc>) -> GateResult {
        match state.cooldown_until {
            Some(until) if until > now => GateResult::Block(RiskDenial::new(
                RiskCode::CooldownActive,
                format!(
                    "Cooldown active for another {}s (until {})",
                    (until - now).num_seconds(),
                    until.to_rfc3339()
                ),
            )),
            _ => GateResult::Pass,
        }
    }

    pub fn check_daily_loss(&self, state: &RiskState, limits: &StrategyLimits) -> GateResult {
        let loss = state.daily_loss_usd.abs();
        if loss >= limits.max_daily_loss_usd {
            GateResult::Block(RiskDenial::new(
                RiskCode::DailyLossExceeded,
                format!(
                    "Daily loss ${loss} reached limit ${}",
                    limits.max_daily_loss_usd
                ),
            ))
        } else {
            GateResult::Pass
        }
    }

    pub fn check_trade_count(&self, state: &RiskState, limits: &StrategyLimits) -> GateResult {
        if state.daily_trade_count >= limits.max_trades_per_day {
            GateResult::Block(RiskDenial::new(
                RiskCode::MaxTradesExceeded,
                format!(
                    "{} trades today, limit {}",
                    state.daily_trade_count, limits.max_trades_per_day
                ),
            ))
        } else {
            GateResult::Pass
        }
    }

    pub fn check_position_size(&self, limits: &StrategyLimits, notional_usd: Decimal) -> GateResult {
        if notional_usd > limits.max_position_usd {
            GateResult::Block(RiskDenial::new(
                RiskCode::PositionSizeExceeded,
                format!(
                    "Notional ${notional_usd} exceeds position limit ${}",
                    limits.max_position_usd
                ),
            ))
        } else {
            GateResult::Pass
        }
    }
}
