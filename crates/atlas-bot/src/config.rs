//! Application configuration.

use crate::error::{AppError, AppResult};
use atlas_executor::{AlpacaConfig, RetryPolicy};
use atlas_strategy::StrategyConfig;
use atlas_telemetry::LoggingConfig;
use atlas_ws::ConnectionConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub websocket: WsConfig,
    /// Symbols whose book, BBO and asset context are streamed.
    #[serde(default)]
    pub markets: Vec<String>,
    /// Also stream the `allMids` channel.
    #[serde(default)]
    pub subscribe_all_mids: bool,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

// ============================================================================
// WebSocket
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    #[serde(default = "default_ws_url")]
    pub url: String,
    /// Consecutive failed attempts before giving up (0 = never).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// 0 disables the pong deadline.
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
}

fn default_ws_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_jitter_ms() -> u64 {
    1_000
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_pong_timeout_ms() -> u64 {
    60_000
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
        }
    }
}

impl From<WsConfig> for ConnectionConfig {
    fn from(cfg: WsConfig) -> Self {
        Self {
            url: cfg.url,
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            reconnect_jitter_ms: cfg.reconnect_jitter_ms,
            ping_interval_ms: cfg.ping_interval_ms,
            pong_timeout_ms: cfg.pong_timeout_ms,
        }
    }
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Every order fills locally.
    #[default]
    Paper,
    Alpaca,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default = "default_broker_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key id.
    #[serde(default = "default_key_id_env")]
    pub key_id_env: String,
    /// Environment variable holding the API secret.
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    /// Starting cash of the paper broker.
    #[serde(default = "default_paper_cash")]
    pub paper_cash: Decimal,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_broker_base_url() -> String {
    "https://paper-api.alpaca.markets".to_string()
}

fn default_key_id_env() -> String {
    "ALPACA_KEY_ID".to_string()
}

fn default_secret_key_env() -> String {
    "ALPACA_SECRET_KEY".to_string()
}

fn default_quote_currency() -> String {
    "USD".to_string()
}

fn default_paper_cash() -> Decimal {
    Decimal::from(100_000)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            base_url: default_broker_base_url(),
            key_id_env: default_key_id_env(),
            secret_key_env: default_secret_key_env(),
            quote_currency: default_quote_currency(),
            paper_cash: default_paper_cash(),
            retry: RetryPolicy::default(),
        }
    }
}

impl BrokerConfig {
    /// Alpaca settings with credentials read from the environment.
    pub fn alpaca(&self) -> AppResult<AlpacaConfig> {
        let read = |var: &str| {
            std::env::var(var)
                .map_err(|_| AppError::Config(format!("environment variable {var} is not set")))
        };
        Ok(AlpacaConfig {
            base_url: self.base_url.clone(),
            key_id: read(&self.key_id_env)?,
            secret_key: read(&self.secret_key_env)?,
            quote_currency: self.quote_currency.clone(),
        })
    }
}

// ============================================================================
// Execution loops
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Stop-loss / take-profit check cadence.
    #[serde(default = "default_exit_check_interval_ms")]
    pub exit_check_interval_ms: u64,
    /// Cadence of refreshing orders still live at the broker.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Live orders older than this are cancelled on reconcile (0 = never).
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    /// Capacity of the intent queue between evaluators and the pipeline.
    #[serde(default = "default_intent_queue")]
    pub intent_queue: usize,
}

fn default_exit_check_interval_ms() -> u64 {
    1_000
}

fn default_reconcile_interval_ms() -> u64 {
    5_000
}

fn default_order_timeout_secs() -> u64 {
    120
}

fn default_intent_queue() -> usize {
    64
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            exit_check_interval_ms: default_exit_check_interval_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            order_timeout_secs: default_order_timeout_secs(),
            intent_queue: default_intent_queue(),
        }
    }
}

// ============================================================================
// Pattern feed
// ============================================================================

/// Momentum patterns sampled from the cached mid and fed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    #[serde(default = "default_pattern_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Mid move is measured against the sample this far back.
    #[serde(default = "default_pattern_lookback_secs")]
    pub lookback_secs: u64,
    /// Move that maps to full pattern strength.
    #[serde(default = "default_pattern_full_strength_bps")]
    pub full_strength_bps: Decimal,
    /// Moves below this are not reported.
    #[serde(default = "default_pattern_min_move_bps")]
    pub min_move_bps: Decimal,
}

fn default_pattern_sample_interval_ms() -> u64 {
    5_000
}

fn default_pattern_lookback_secs() -> u64 {
    60
}

fn default_pattern_full_strength_bps() -> Decimal {
    Decimal::from(50)
}

fn default_pattern_min_move_bps() -> Decimal {
    Decimal::from(5)
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_pattern_sample_interval_ms(),
            lookback_secs: default_pattern_lookback_secs(),
            full_strength_bps: default_pattern_full_strength_bps(),
            min_move_bps: default_pattern_min_move_bps(),
        }
    }
}

// ============================================================================
// Persistence / telemetry
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Journal directory. Without one the store lives only in memory.
    #[serde(default)]
    pub journal_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Port of the Prometheus `/metrics` endpoint (0 disables it).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            logging: LoggingConfig::default(),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl AppConfig {
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config {path}: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.websocket.url.trim().is_empty() {
            return Err(AppError::Config("websocket.url is empty".to_string()));
        }
        if self.execution.intent_queue == 0 {
            return Err(AppError::Config(
                "execution.intent_queue must be positive".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for strategy in &self.strategies {
            strategy.validate()?;
            if !ids.insert(strategy.id.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate strategy id {}",
                    strategy.id
                )));
            }
        }
        Ok(())
    }

    /// Streamed symbols: configured markets plus every strategy symbol,
    /// uppercased and deduplicated in first-seen order.
    pub fn stream_symbols(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.markets
            .iter()
            .chain(self.strategies.iter().map(|s| &s.symbol))
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect()
    }
}
