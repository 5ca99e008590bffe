//! Periodic strategy evaluation.
//!
//! For an `IDLE` strategy the evaluator reads the cached market snapshot
//! and the day's risk row, pre-checks the risk gate, asks the decision
//! agent, and on approval walks the strategy `IDLE -> SETUP -> TRIGGERED`
//! and emits an `Intent` for the execution pipeline. The intent row is
//! written before `TRIGGERED`, so a strategy left `TRIGGERED` re-emits it
//! on the next tick or falls back to `IDLE`.

use crate::config::AgentConfig;
use crate::decision::{DecisionAgent, DecisionInput, RecentPattern, Verdict};
use crate::error::{StrategyError, StrategyResult};
use crate::state_machine::StrategyStateMachine;
use atlas_core::{Clock, Intent, IntentStatus, Strategy, StrategyState};
use atlas_feed::MarketSnapshotCache;
use atlas_risk::{RiskDecision, RiskDenial, RiskGate, RiskLedger};
use atlas_store::Tables;
use atlas_telemetry::Metrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one evaluation.
#[derive(Debug, Clone)]
pub enum EvaluationOutcome {
    /// The strategy is not idle or not enabled.
    Skipped(String),
    /// The risk gate would deny any trade right now.
    Denied(RiskDenial),
    /// The agent did not approve.
    NoTrade { verdict: Verdict, reason: String },
    /// The strategy is `TRIGGERED` with this intent.
    Triggered(Intent),
}

/// Strategy evaluator shared by the per-strategy loops.
pub struct StrategyEvaluator {
    tables: Tables,
    cache: Arc<MarketSnapshotCache>,
    ledger: Arc<RiskLedger>,
    gate: RiskGate,
    agent: Arc<dyn DecisionAgent>,
    machine: StrategyStateMachine,
    clock: Arc<dyn Clock>,
    agent_configs: HashMap<String, AgentConfig>,
    patterns: RwLock<HashMap<String, Vec<RecentPattern>>>,
}

impl StrategyEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tables: Tables,
        cache: Arc<MarketSnapshotCache>,
        ledger: Arc<RiskLedger>,
        agent: Arc<dyn DecisionAgent>,
        machine: StrategyStateMachine,
        clock: Arc<dyn Clock>,
        agent_configs: HashMap<String, AgentConfig>,
    ) -> Self {
        Self {
            tables,
            cache,
            ledger,
            gate: RiskGate::new(),
            agent,
            machine,
            clock,
            agent_configs,
            patterns: RwLock::new(HashMap::new()),
        }
    }

    /// Record a detected pattern for `symbol`; the newest 20 are kept.
    pub fn push_pattern(&self, symbol: &str, pattern: RecentPattern) {
        let mut patterns = self.patterns.write();
        let list = patterns.entry(symbol.to_ascii_uppercase()).or_default();
        list.push(pattern);
        if list.len() > 20 {
            let excess = list.len() - 20;
            list.drain(..excess);
        }
    }

    fn recent_patterns(&self, symbol: &str) -> Vec<RecentPattern> {
        self.patterns
            .read()
            .get(&symbol.to_ascii_uppercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Evaluate one strategy once.
    pub async fn evaluate_once(&self, strategy_id: &str) -> StrategyResult<EvaluationOutcome> {
        let strategy = self
            .tables
            .get_strategy(strategy_id)
            .await?
            .ok_or_else(|| StrategyError::NotFound(strategy_id.to_string()))?;

        if strategy.is_disabled() {
            return Ok(EvaluationOutcome::Skipped("disabled".to_string()));
        }
        let now = self.clock.now();
        if strategy.current_state == StrategyState::Cooldown {
            return self.release_cooldown(&strategy.id, &strategy.account, now).await;
        }
        if strategy.current_state == StrategyState::Triggered {
            return self.resume_triggered(&strategy).await;
        }
        if strategy.current_state != StrategyState::Idle {
            return Ok(EvaluationOutcome::Skipped(format!(
                "state {}",
                strategy.current_state
            )));
        }

        let config = self
            .agent_configs
            .get(strategy_id)
            .cloned()
            .unwrap_or_default();

        let Some(market) = self.cache.snapshot(&strategy.symbol) else {
            return Ok(EvaluationOutcome::Skipped("no market data".to_string()));
        };
        if let Some(age) = market.staleness_ms(now) {
            Metrics::market_staleness(&strategy.symbol, age as f64);
        }

        let risk = self.ledger.current(&strategy.account).await?;
        if let RiskDecision::Deny(denial) =
            self.gate
                .evaluate(&risk, &strategy.limits, config.qty_usd, now)
        {
            debug!(strategy_id, code = %denial.code, "Evaluation pre-check denied");
            return Ok(EvaluationOutcome::Denied(denial));
        }

        let input = DecisionInput {
            market,
            risk,
            recent_patterns: self.recent_patterns(&strategy.symbol),
            config,
            now,
        };
        let decision = self.agent.decide(&input).await?;

        let params = match (decision.verdict, decision.params) {
            (Verdict::Approve, Some(params)) => params,
            (verdict, _) => {
                debug!(strategy_id, ?verdict, reason = %decision.reason, "No trade");
                return Ok(EvaluationOutcome::NoTrade {
                    verdict,
                    reason: decision.reason,
                });
            }
        };

        let metadata = json!({
            "agent": self.agent.name(),
            "confidence": decision.confidence,
            "reason": decision.reason,
        });
        self.machine
            .transition(strategy_id, StrategyState::Idle, StrategyState::Setup, metadata)
            .await?;

        let mut intent = Intent::new(strategy_id, &strategy.symbol, params.side, params.qty_usd);
        intent.created_at = now;
        if let Some(px) = params.entry_price {
            intent = intent.with_intended_price(px);
        }
        if let Some(px) = params.stop_loss {
            intent = intent.with_stop_loss(px);
        }
        if let Some(px) = params.take_profit {
            intent = intent.with_take_profit(px);
        }

        if let Err(e) = intent.validate() {
            warn!(strategy_id, error = %e, "Agent produced an invalid intent");
            self.machine
                .transition(
                    strategy_id,
                    StrategyState::Setup,
                    StrategyState::Idle,
                    json!({"reason": e.to_string()}),
                )
                .await?;
            return Ok(EvaluationOutcome::NoTrade {
                verdict: Verdict::Block,
                reason: e.to_string(),
            });
        }

        if let Err(e) = self.tables.insert_intent(&intent).await {
            warn!(strategy_id, error = %e, "Failed to persist intent");
            self.machine
                .transition(
                    strategy_id,
                    StrategyState::Setup,
                    StrategyState::Idle,
                    json!({"reason": "intent not persisted"}),
                )
                .await?;
            return Err(e.into());
        }

        self.machine
            .transition(
                strategy_id,
                StrategyState::Setup,
                StrategyState::Triggered,
                json!({"intent_id": intent.id, "client_order_id": intent.client_order_id}),
            )
            .await?;

        info!(
            strategy_id,
            symbol = %intent.symbol,
            side = %intent.side,
            qty_usd = %intent.qty_usd,
            "Strategy triggered"
        );
        Ok(EvaluationOutcome::Triggered(intent))
    }

    /// A `TRIGGERED` strategy re-emits its stored intent while the pipeline
    /// has not moved past approval. Without a live intent it returns to
    /// `IDLE`.
    async fn resume_triggered(&self, strategy: &Strategy) -> StrategyResult<EvaluationOutcome> {
        let intent = match strategy.state_metadata["intent_id"].as_str() {
            Some(id) => self.tables.get_intent(id).await?,
            None => None,
        };
        if let Some(intent) = intent.filter(|i| {
            matches!(i.status, IntentStatus::Pending | IntentStatus::Approved)
        }) {
            info!(strategy_id = %strategy.id, intent_id = %intent.id, "Re-emitting stored intent");
            return Ok(EvaluationOutcome::Triggered(intent));
        }

        warn!(strategy_id = %strategy.id, "Triggered strategy has no live intent, returning to IDLE");
        self.machine
            .transition(
                &strategy.id,
                StrategyState::Triggered,
                StrategyState::Idle,
                json!({"reason": "intent missing"}),
            )
            .await?;
        Ok(EvaluationOutcome::Skipped("intent missing".to_string()))
    }

    /// `COOLDOWN -> IDLE` once the account cooldown has expired.
    async fn release_cooldown(
        &self,
        strategy_id: &str,
        account: &str,
        now: DateTime<Utc>,
    ) -> StrategyResult<EvaluationOutcome> {
        let risk = self.ledger.current(account).await?;
        if let Some(until) = risk.cooldown_until.filter(|_| risk.cooldown_active(now)) {
            return Ok(EvaluationOutcome::Skipped(format!("cooldown until {until}")));
        }
        self.machine
            .transition(
                strategy_id,
                StrategyState::Cooldown,
                StrategyState::Idle,
                json!({"reason": "cooldown expired"}),
            )
            .await?;
        Ok(EvaluationOutcome::Skipped("cooldown released".to_string()))
    }

    /// Evaluate `strategy_id` every `interval` until cancelled, sending
    /// triggered intents to `intents`.
    pub async fn run(
        self: Arc<Self>,
        strategy_id: String,
        interval: Duration,
        intents: mpsc::Sender<Intent>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(%strategy_id, interval_secs = interval.as_secs(), "Strategy evaluator started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.evaluate_once(&strategy_id).await {
                        Ok(EvaluationOutcome::Triggered(intent)) => {
                            if intents.send(intent).await.is_err() {
                                warn!(%strategy_id, "Intent receiver closed, stopping evaluator");
                                break;
                            }
                        }
                        Ok(outcome) => debug!(%strategy_id, ?outcome, "Evaluation finished"),
                        Err(e) => warn!(%strategy_id, error = %e, "Evaluation failed"),
                    }
                }
            }
        }
        info!(%strategy_id, "Strategy evaluator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ThresholdAgent;
    use atlas_core::{BookLevel, ManualClock, OrderSide, Price, Size, StrategyLimits, StrategyMode};
    use atlas_store::{MemoryStore, Store, Table};
    use atlas_feed::MarketEvent;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-05T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Fixture {
        tables: Tables,
        cache: Arc<MarketSnapshotCache>,
        ledger: Arc<RiskLedger>,
        evaluator: StrategyEvaluator,
    }

    async fn fixture(mode: StrategyMode) -> Fixture {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(t0()));
        let tables = Tables::new(Arc::new(MemoryStore::new()));
        let strategy = Strategy::new("s1", "acct", "BTC", mode, StrategyLimits::default());
        tables.insert_strategy(&strategy).await.unwrap();

        let cache = Arc::new(MarketSnapshotCache::new(clock.clone()));
        let ledger = Arc::new(RiskLedger::new(tables.clone(), clock.clone()));
        let machine = StrategyStateMachine::new(tables.clone(), clock.clone());
        let evaluator = StrategyEvaluator::new(
            tables.clone(),
            cache.clone(),
            ledger.clone(),
            Arc::new(ThresholdAgent::new()),
            machine,
            clock,
            HashMap::new(),
        );
        Fixture {
            tables,
            cache,
            ledger,
            evaluator,
        }
    }

    fn seed_book(cache: &MarketSnapshotCache) {
        cache.apply(
            MarketEvent::Book {
                symbol: "BTC".to_string(),
                bids: vec![BookLevel::new(Price::new(dec!(100)), Size::new(dec!(5)))],
                asks: vec![BookLevel::new(Price::new(dec!(100.2)), Size::new(dec!(5)))],
                time_ms: Some(1),
            },
            t0(),
        );
    }

    fn bullish() -> RecentPattern {
        RecentPattern {
            name: "breakout".to_string(),
            side: OrderSide::Buy,
            strength: dec!(0.9),
            observed_at: t0(),
        }
    }

    #[tokio::test]
    async fn test_approval_triggers_strategy_and_emits_intent() {
        let f = fixture(StrategyMode::Paper).await;
        seed_book(&f.cache);
        f.evaluator.push_pattern("btc", bullish());

        let outcome = f.evaluator.evaluate_once("s1").await.unwrap();
        let EvaluationOutcome::Triggered(intent) = outcome else {
            panic!("expected trigger, got {outcome:?}");
        };
        assert_eq!(intent.symbol, "BTC");
        assert_eq!(intent.side, OrderSide::Buy);
        assert_eq!(intent.intended_price, Some(Price::new(dec!(100.1))));

        let strategy = f.tables.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(strategy.current_state, StrategyState::Triggered);
        assert_eq!(
            strategy.state_metadata["client_order_id"],
            intent.client_order_id.as_str()
        );
    }

    #[tokio::test]
    async fn test_triggered_intent_is_persisted_and_reemitted() {
        let f = fixture(StrategyMode::Paper).await;
        seed_book(&f.cache);
        f.evaluator.push_pattern("BTC", bullish());

        let EvaluationOutcome::Triggered(first) = f.evaluator.evaluate_once("s1").await.unwrap()
        else {
            panic!("expected trigger");
        };
        let stored = f.tables.get_intent(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Pending);

        // Emitted intent never reached the pipeline.
        let EvaluationOutcome::Triggered(again) = f.evaluator.evaluate_once("s1").await.unwrap()
        else {
            panic!("expected re-emission");
        };
        assert_eq!(again.id, first.id);
        assert_eq!(again.client_order_id, first.client_order_id);
    }

    #[tokio::test]
    async fn test_triggered_without_intent_returns_to_idle() {
        let f = fixture(StrategyMode::Paper).await;
        seed_book(&f.cache);
        f.evaluator.push_pattern("BTC", bullish());

        let EvaluationOutcome::Triggered(intent) = f.evaluator.evaluate_once("s1").await.unwrap()
        else {
            panic!("expected trigger");
        };
        f.tables
            .store()
            .delete_row(Table::Intents, &intent.id)
            .await
            .unwrap();

        let outcome = f.evaluator.evaluate_once("s1").await.unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Skipped(reason) if reason == "intent missing"));
        let strategy = f.tables.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(strategy.current_state, StrategyState::Idle);

        // Next tick evaluates afresh.
        assert!(matches!(
            f.evaluator.evaluate_once("s1").await.unwrap(),
            EvaluationOutcome::Triggered(_)
        ));
    }

    #[tokio::test]
    async fn test_triggered_with_finished_intent_returns_to_idle() {
        let f = fixture(StrategyMode::Paper).await;
        seed_book(&f.cache);
        f.evaluator.push_pattern("BTC", bullish());

        let EvaluationOutcome::Triggered(intent) = f.evaluator.evaluate_once("s1").await.unwrap()
        else {
            panic!("expected trigger");
        };
        f.tables
            .set_intent_status(&intent.id, IntentStatus::Denied)
            .await
            .unwrap();

        f.evaluator.evaluate_once("s1").await.unwrap();
        let strategy = f.tables.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(strategy.current_state, StrategyState::Idle);
    }

    #[tokio::test]
    async fn test_no_signal_keeps_idle() {
        let f = fixture(StrategyMode::Paper).await;
        seed_book(&f.cache);
        let outcome = f.evaluator.evaluate_once("s1").await.unwrap();
        assert!(matches!(
            outcome,
            EvaluationOutcome::NoTrade {
                verdict: Verdict::Wait,
                ..
            }
        ));
        let strategy = f.tables.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(strategy.current_state, StrategyState::Idle);
    }

    #[tokio::test]
    async fn test_risk_precheck_denies_before_agent() {
        let f = fixture(StrategyMode::Paper).await;
        seed_book(&f.cache);
        f.evaluator.push_pattern("BTC", bullish());
        f.ledger.activate_kill_switch("acct", "test").await.unwrap();

        let outcome = f.evaluator.evaluate_once("s1").await.unwrap();
        let EvaluationOutcome::Denied(denial) = outcome else {
            panic!("expected denial");
        };
        assert_eq!(denial.code, atlas_core::RiskCode::KillSwitchActive);
    }

    #[tokio::test]
    async fn test_skips_without_market_or_when_disabled() {
        let f = fixture(StrategyMode::Paper).await;
        assert!(matches!(
            f.evaluator.evaluate_once("s1").await.unwrap(),
            EvaluationOutcome::Skipped(_)
        ));

        let f = fixture(StrategyMode::Disabled).await;
        seed_book(&f.cache);
        assert!(matches!(
            f.evaluator.evaluate_once("s1").await.unwrap(),
            EvaluationOutcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn test_cooldown_released_only_after_expiry() {
        let f = fixture(StrategyMode::Paper).await;
        seed_book(&f.cache);
        let machine = StrategyStateMachine::new(f.tables.clone(), Arc::new(ManualClock::new(t0())));
        for (from, to) in [
            (StrategyState::Idle, StrategyState::Setup),
            (StrategyState::Setup, StrategyState::Triggered),
            (StrategyState::Triggered, StrategyState::Ordering),
            (StrategyState::Ordering, StrategyState::InPosition),
            (StrategyState::InPosition, StrategyState::Exiting),
            (StrategyState::Exiting, StrategyState::Cooldown),
        ] {
            machine.transition("s1", from, to, serde_json::Value::Null).await.unwrap();
        }

        f.ledger
            .start_cooldown("acct", t0() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(matches!(
            f.evaluator.evaluate_once("s1").await.unwrap(),
            EvaluationOutcome::Skipped(reason) if reason.starts_with("cooldown until")
        ));

        f.ledger.clear_cooldown("acct").await.unwrap();
        f.evaluator.evaluate_once("s1").await.unwrap();
        let strategy = f.tables.get_strategy("s1").await.unwrap().unwrap();
        assert_eq!(strategy.current_state, StrategyState::Idle);
    }

    #[tokio::test]
    async fn test_run_loop_sends_intent_and_stops_on_cancel() {
        let f = fixture(StrategyMode::Paper).await;
        seed_book(&f.cache);
        f.evaluator.push_pattern("BTC", bullish());

        let evaluator = Arc::new(f.evaluator);
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(evaluator.run(
            "s1".to_string(),
            Duration::from_millis(10),
            tx,
            shutdown.clone(),
        ));

        let intent = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intent.strategy_id, "s1");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
