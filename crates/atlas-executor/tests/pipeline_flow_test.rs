//! End-to-end flow: evaluator trigger, execution, bracket exit, cooldown.

use atlas_core::{
    BookLevel, Clock, IntentStatus, ManualClock, OrderSide, OrderStatus, Price, RiskCode, Size,
    Strategy, StrategyLimits, StrategyMode, StrategyState,
};
use atlas_executor::{
    BrokerError, ExecutorError, ExitReason, OrderExecutionPipeline, RetryPolicy, ScriptedBroker,
};
use atlas_feed::{MarketEvent, MarketSnapshotCache};
use atlas_risk::RiskLedger;
use atlas_store::{MemoryStore, Tables};
use atlas_strategy::{
    EvaluationOutcome, RecentPattern, StrategyEvaluator, StrategyStateMachine, ThresholdAgent,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T09:30:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

struct World {
    tables: Tables,
    clock: Arc<ManualClock>,
    cache: Arc<MarketSnapshotCache>,
    ledger: Arc<RiskLedger>,
    broker: Arc<ScriptedBroker>,
    evaluator: StrategyEvaluator,
    pipeline: OrderExecutionPipeline,
}

async fn world(mode: StrategyMode) -> World {
    let clock = Arc::new(ManualClock::new(t0()));
    let tables = Tables::new(Arc::new(MemoryStore::new()));
    tables
        .insert_strategy(&Strategy::new(
            "momo",
            "acct-1",
            "ETH",
            mode,
            StrategyLimits::default(),
        ))
        .await
        .unwrap();

    let cache = Arc::new(MarketSnapshotCache::new(clock.clone()));
    let ledger = Arc::new(RiskLedger::new(tables.clone(), clock.clone()));
    let broker = Arc::new(ScriptedBroker::new());
    let evaluator = StrategyEvaluator::new(
        tables.clone(),
        cache.clone(),
        ledger.clone(),
        Arc::new(ThresholdAgent::new()),
        StrategyStateMachine::new(tables.clone(), clock.clone()),
        clock.clone(),
        HashMap::new(),
    );
    let pipeline = OrderExecutionPipeline::new(
        tables.clone(),
        broker.clone(),
        cache.clone(),
        ledger.clone(),
        StrategyStateMachine::new(tables.clone(), clock.clone()),
        clock.clone(),
    )
    .with_retry(RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 1,
    });

    World {
        tables,
        clock,
        cache,
        ledger,
        broker,
        evaluator,
        pipeline,
    }
}

fn book(cache: &MarketSnapshotCache, now: DateTime<Utc>, bid: Decimal, ask: Decimal, time_ms: i64) {
    cache.apply(
        MarketEvent::Book {
            symbol: "ETH".to_string(),
            bids: vec![BookLevel::new(Price::new(bid), Size::new(dec!(50)))],
            asks: vec![BookLevel::new(Price::new(ask), Size::new(dec!(50)))],
            time_ms: Some(time_ms),
        },
        now,
    );
}

fn breakout(at: DateTime<Utc>) -> RecentPattern {
    RecentPattern {
        name: "breakout".to_string(),
        side: OrderSide::Buy,
        strength: dec!(0.8),
        observed_at: at,
    }
}

async fn state(w: &World) -> StrategyState {
    w.tables.require_strategy("momo").await.unwrap().current_state
}

#[tokio::test]
async fn test_trigger_fill_stop_out_and_cooldown_release() {
    let w = world(StrategyMode::Paper).await;
    book(&w.cache, t0(), dec!(100), dec!(100.2), 1);
    w.evaluator.push_pattern("ETH", breakout(t0()));

    let EvaluationOutcome::Triggered(intent) = w.evaluator.evaluate_once("momo").await.unwrap()
    else {
        panic!("expected the breakout to trigger");
    };
    assert_eq!(state(&w).await, StrategyState::Triggered);

    let report = w.pipeline.execute(intent.clone()).await.unwrap();
    assert_eq!(report.order.status, OrderStatus::Filled);
    assert!(report.order.is_paper);
    assert_eq!(report.order.filled_avg_price, Some(Price::new(dec!(100.1))));
    let position = report.position.expect("position opened");
    assert_eq!(position.entry_price, Price::new(dec!(100.1)));
    assert_eq!(state(&w).await, StrategyState::InPosition);
    assert_eq!(
        w.tables.get_intent(&intent.id).await.unwrap().unwrap().status,
        IntentStatus::Filled
    );

    // Nothing to close while the price sits inside the bracket.
    assert!(w.pipeline.process_exits().await.is_empty());

    w.clock.advance(Duration::seconds(30));
    book(&w.cache, w.clock.now(), dec!(97), dec!(97.2), 2);
    let closes = w.pipeline.process_exits().await;
    assert_eq!(closes.len(), 1);
    let close = &closes[0];
    assert_eq!(close.position.id, position.id);
    assert_eq!(close.position.exit_price, Some(Price::new(dec!(97.1))));
    assert!(close.realized_pnl_usd < Decimal::ZERO);
    assert_eq!(state(&w).await, StrategyState::Cooldown);

    let risk = w.ledger.current("acct-1").await.unwrap();
    assert_eq!(risk.daily_trade_count, 1);
    assert_eq!(risk.daily_loss_usd, -close.realized_pnl_usd);
    assert_eq!(close.cooldown_until, risk.cooldown_until);

    // Still cooling down.
    assert!(matches!(
        w.evaluator.evaluate_once("momo").await.unwrap(),
        EvaluationOutcome::Skipped(_)
    ));
    assert_eq!(state(&w).await, StrategyState::Cooldown);

    w.clock.advance(Duration::minutes(16));
    w.evaluator.evaluate_once("momo").await.unwrap();
    assert_eq!(state(&w).await, StrategyState::Idle);
}

#[tokio::test]
async fn test_dropped_intent_is_reemitted_and_executes_once() {
    let w = world(StrategyMode::Paper).await;
    book(&w.cache, t0(), dec!(100), dec!(100.2), 1);
    w.evaluator.push_pattern("ETH", breakout(t0()));

    // First delivery lost before the pipeline saw it.
    let EvaluationOutcome::Triggered(lost) = w.evaluator.evaluate_once("momo").await.unwrap()
    else {
        panic!("expected the breakout to trigger");
    };
    drop(lost);
    assert_eq!(state(&w).await, StrategyState::Triggered);

    let EvaluationOutcome::Triggered(intent) = w.evaluator.evaluate_once("momo").await.unwrap()
    else {
        panic!("expected the stored intent again");
    };
    let report = w.pipeline.execute(intent.clone()).await.unwrap();
    assert_eq!(report.order.status, OrderStatus::Filled);
    assert_eq!(state(&w).await, StrategyState::InPosition);

    // A stale duplicate resolves to the recorded order.
    let replay = w.pipeline.execute(intent.clone()).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(w.tables.orders_for_intent(&intent.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_live_outage_falls_back_and_is_idempotent() {
    let w = world(StrategyMode::Live).await;
    book(&w.cache, t0(), dec!(100), dec!(100.2), 1);
    w.evaluator.push_pattern("ETH", breakout(t0()));
    let EvaluationOutcome::Triggered(intent) = w.evaluator.evaluate_once("momo").await.unwrap()
    else {
        panic!("expected the breakout to trigger");
    };

    w.broker
        .push_submit(Err(BrokerError::Transport("connection reset".to_string())));
    w.broker
        .push_submit(Err(BrokerError::Transport("connection reset".to_string())));

    let first = w.pipeline.execute(intent.clone()).await.unwrap();
    assert!(first.order.is_paper);
    assert_eq!(first.order.status, OrderStatus::Filled);
    assert_eq!(first.order.filled_avg_price, intent.intended_price);
    assert_eq!(w.broker.requests().len(), 2);
    assert_eq!(
        w.pipeline.event_board().current("acct-1").unwrap().code,
        RiskCode::PaperFallback
    );

    let replay = w.pipeline.execute(intent.clone()).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.order.id, first.order.id);
    assert_eq!(w.broker.requests().len(), 2);
    assert_eq!(w.tables.orders_for_intent(&intent.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_kill_switch_denies_execution() {
    let w = world(StrategyMode::Live).await;
    book(&w.cache, t0(), dec!(100), dec!(100.2), 1);
    w.evaluator.push_pattern("ETH", breakout(t0()));
    let EvaluationOutcome::Triggered(intent) = w.evaluator.evaluate_once("momo").await.unwrap()
    else {
        panic!("expected the breakout to trigger");
    };

    w.ledger
        .activate_kill_switch("acct-1", "manual halt")
        .await
        .unwrap();
    let err = w.pipeline.execute(intent).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::RiskDenied {
            code: RiskCode::KillSwitchActive,
            ..
        }
    ));
    assert!(w.broker.requests().is_empty());
    assert_eq!(state(&w).await, StrategyState::Idle);
}
