//! Strategy configuration.

use crate::error::{StrategyError, StrategyResult};
use atlas_core::{Strategy, StrategyLimits, StrategyMode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One configured strategy (`[[strategies]]` in the TOML config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub account: String,
    pub symbol: String,
    #[serde(default)]
    pub mode: StrategyMode,
    #[serde(default)]
    pub limits: StrategyLimits,
    /// Seconds between evaluations.
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_evaluation_interval_secs() -> u64 {
    300
}

impl StrategyConfig {
    pub fn validate(&self) -> StrategyResult<()> {
        if self.id.trim().is_empty() {
            return Err(StrategyError::ConfigError("strategy id is empty".to_string()));
        }
        if self.symbol.trim().is_empty() {
            return Err(StrategyError::ConfigError(format!(
                "strategy {} has no symbol",
                self.id
            )));
        }
        if self.evaluation_interval_secs == 0 {
            return Err(StrategyError::ConfigError(format!(
                "strategy {} evaluation interval must be positive",
                self.id
            )));
        }
        self.agent.validate()
    }

    /// Fresh `IDLE` strategy row for this config.
    pub fn to_strategy(&self) -> Strategy {
        Strategy::new(
            self.id.clone(),
            self.account.clone(),
            self.symbol.clone(),
            self.mode,
            self.limits.clone(),
        )
    }
}

/// Settings of the deterministic threshold agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Minimum confidence (0..=1) to approve.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Decimal,
    /// Minimum absolute pattern score before a side is chosen.
    #[serde(default = "default_min_signal")]
    pub min_signal: Decimal,
    /// Notional per trade in USD.
    #[serde(default = "default_qty_usd")]
    pub qty_usd: Decimal,
    /// Stop-loss distance from entry, percent.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Take-profit distance from entry, percent.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,
    /// Widest acceptable spread, percent of best bid.
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: Decimal,
    /// Market data older than this is not traded on.
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: i64,
}

fn default_min_confidence() -> Decimal {
    Decimal::new(6, 1)
}

fn default_min_signal() -> Decimal {
    Decimal::new(3, 1)
}

fn default_qty_usd() -> Decimal {
    Decimal::from(100)
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::from(2)
}

fn default_take_profit_pct() -> Decimal {
    Decimal::from(4)
}

fn default_max_spread_pct() -> Decimal {
    Decimal::new(5, 1)
}

fn default_max_staleness_ms() -> i64 {
    10_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_signal: default_min_signal(),
            qty_usd: default_qty_usd(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            max_spread_pct: default_max_spread_pct(),
            max_staleness_ms: default_max_staleness_ms(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> StrategyResult<()> {
        if self.min_confidence < Decimal::ZERO || self.min_confidence > Decimal::ONE {
            return Err(StrategyError::ConfigError(format!(
                "min_confidence must be within 0..=1, got {}",
                self.min_confidence
            )));
        }
        if self.qty_usd <= Decimal::ZERO {
            return Err(StrategyError::ConfigError(format!(
                "qty_usd must be positive, got {}",
                self.qty_usd
            )));
        }
        if self.stop_loss_pct <= Decimal::ZERO
            || self.stop_loss_pct >= Decimal::ONE_HUNDRED
            || self.take_profit_pct <= Decimal::ZERO
        {
            return Err(StrategyError::ConfigError(
                "stop_loss_pct must be within (0, 100) and take_profit_pct positive".to_string(),
            ));
        }
        Ok(())
    }
}
