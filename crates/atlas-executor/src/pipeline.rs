//! Order execution pipeline.
//!
//! # Flow (per intent)
//!
//! 1. Validate the intent                     → `InvalidOrder`, no side effects
//! 2. Risk gate (`execute` only)              → `RiskDenied` + audit event
//! 3. `TRIGGERED → ORDERING` (`execute` only)
//! 4. Find-or-create the `pending` order row keyed by client order id
//! 5. Submit to the broker with retries (paper strategies fill locally)
//! 6. On broker failure, paper fill at the intended price or cached mid
//! 7. Fill + position + `ORDERING → IN_POSITION`, or `ORDERING → IDLE`
//! 8. Count the trade against the day's risk row
//!
//! Everything after the broker call is best effort: a persistence
//! failure there is logged and returned in `ExecutionReport::warnings`,
//! never unwinding the fill.

use crate::broker::{Broker, BrokerOrder, OrderRequest};
use crate::error::{BrokerError, BrokerResult, ExecutorError, ExecutorResult};
use crate::paper::PaperBroker;
use crate::retry::{submit_with_retry, RetryPolicy};
use atlas_core::{
    ClientOrderId, Clock, Fill, Intent, IntentStatus, MarketSnapshot, Order, OrderStatus, Position,
    Price, RiskCode, RiskEvent, Size, Strategy, StrategyState,
};
use atlas_feed::MarketSnapshotCache;
use atlas_risk::{RiskDecision, RiskDenial, RiskEventBoard, RiskGate, RiskLedger};
use atlas_store::{StoreError, Tables};
use atlas_strategy::StrategyStateMachine;
use atlas_telemetry::Metrics;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// Reports
// ============================================================================

/// Outcome of executing or replaying an intent.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub order: Order,
    pub fill: Option<Fill>,
    pub position: Option<Position>,
    /// Strategy state after the pipeline, when it changed it.
    pub strategy_state: Option<StrategyState>,
    /// The order row already held an outcome; the broker was not called.
    pub replayed: bool,
    pub warnings: Vec<String>,
}

/// Outcome of closing a position.
#[derive(Debug, Clone, Serialize)]
pub struct CloseReport {
    pub position: Position,
    pub realized_pnl_usd: Decimal,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub strategy_state: Option<StrategyState>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

/// Open position whose bracket was crossed.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    pub position: Position,
    pub reason: ExitReason,
    pub price: Price,
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct OrderExecutionPipeline {
    tables: Tables,
    broker: Arc<dyn Broker>,
    paper: Arc<PaperBroker>,
    cache: Arc<MarketSnapshotCache>,
    ledger: Arc<RiskLedger>,
    gate: RiskGate,
    machine: StrategyStateMachine,
    events: Arc<RiskEventBoard>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl OrderExecutionPipeline {
    pub fn new(
        tables: Tables,
        broker: Arc<dyn Broker>,
        cache: Arc<MarketSnapshotCache>,
        ledger: Arc<RiskLedger>,
        machine: StrategyStateMachine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let paper = Arc::new(PaperBroker::default().with_market_data(cache.clone()));
        Self {
            tables,
            broker,
            paper,
            cache,
            ledger,
            gate: RiskGate::new(),
            machine,
            events: Arc::new(RiskEventBoard::new()),
            clock,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_event_board(mut self, events: Arc<RiskEventBoard>) -> Self {
        self.events = events;
        self
    }

    pub fn with_paper_broker(mut self, paper: Arc<PaperBroker>) -> Self {
        self.paper = paper;
        self
    }

    pub fn event_board(&self) -> &Arc<RiskEventBoard> {
        &self.events
    }

    /// Run a triggered intent through the risk gate and the broker.
    ///
    /// A replay of an intent whose order row already exists skips the gate
    /// and the `TRIGGERED → ORDERING` transition and resolves to that row.
    pub async fn execute(&self, intent: Intent) -> ExecutorResult<ExecutionReport> {
        validate(&intent)?;
        let strategy = self.load_strategy(&intent.strategy_id).await?;

        if self
            .tables
            .find_order_by_client_id(&intent.client_order_id)
            .await?
            .is_some()
        {
            debug!(client_order_id = %intent.client_order_id, "Intent already has an order row");
            return self.submit(&strategy, &intent).await;
        }

        let now = self.clock.now();
        let risk = self.ledger.current(&strategy.account).await?;
        if let RiskDecision::Deny(denial) =
            self.gate
                .evaluate(&risk, &strategy.limits, intent.qty_usd, now)
        {
            self.record_denial(&strategy, &intent, &denial, now).await;
            return Err(ExecutorError::RiskDenied {
                code: denial.code,
                severity: denial.severity,
                message: denial.message,
            });
        }

        self.ensure_intent(&intent, IntentStatus::Approved).await?;
        self.machine
            .transition(
                &strategy.id,
                StrategyState::Triggered,
                StrategyState::Ordering,
                json!({
                    "intent_id": intent.id,
                    "client_order_id": intent.client_order_id,
                }),
            )
            .await?;

        self.submit(&strategy, &intent).await
    }

    /// Order placement for an approved intent (steps 4 to 8).
    async fn submit(&self, strategy: &Strategy, intent: &Intent) -> ExecutorResult<ExecutionReport> {
        validate(intent)?;
        self.ensure_intent(intent, IntentStatus::Approved).await?;

        let now = self.clock.now();
        let mut order = self.find_or_create_order(intent, now).await?;
        if order.status != OrderStatus::Pending {
            info!(
                client_order_id = %order.client_order_id,
                status = %order.status,
                "Order already recorded, returning recorded outcome"
            );
            return self.recorded_outcome(order).await;
        }

        let reference = intent
            .intended_price
            .or_else(|| self.cache.mid_price(&intent.symbol));
        if !order.qty.is_positive() {
            if let Some(qty) = reference.and_then(|px| Size::from_notional(intent.qty_usd, px)) {
                order.qty = qty;
            }
        }

        self.tables
            .set_intent_status(&intent.id, IntentStatus::Submitted)
            .await?;

        let mut warnings = Vec::new();
        let request = OrderRequest::market(intent, order.qty);
        let (result, is_paper) = if strategy.is_paper() {
            (self.paper_fill(&request, reference).await, true)
        } else {
            match self.submit_live(&request).await {
                Ok(broker_order) => (Ok(broker_order), false),
                Err(e) => {
                    let fallback = self.paper_fill(&request, reference).await;
                    self.note_fallback(strategy, intent, &e, fallback.is_ok(), now, &mut warnings)
                        .await;
                    order.error_message = Some(e.to_string());
                    (fallback, true)
                }
            }
        };

        order.is_paper = is_paper;
        order.updated_at = self.clock.now();
        match result {
            Ok(broker_order) => {
                order.broker_order_id = Some(broker_order.broker_order_id);
                order.status = broker_order.status;
                order.apply_fill(broker_order.filled_qty, broker_order.cumulative_quote_qty);
            }
            Err(e) => {
                warn!(
                    client_order_id = %order.client_order_id,
                    error = %e,
                    "Order rejected, no fill"
                );
                order.status = OrderStatus::Rejected;
                order.error_message = Some(match order.error_message.take() {
                    Some(primary) => format!("{primary}; paper fallback: {e}"),
                    None => e.to_string(),
                });
            }
        }

        Ok(self.finalize(strategy, intent, order, reference, warnings).await)
    }

    /// Cancel an order that is still live at the broker.
    pub async fn cancel_after_submit(
        &self,
        client_order_id: &ClientOrderId,
    ) -> ExecutorResult<ExecutionReport> {
        let mut order = self
            .tables
            .find_order_by_client_id(client_order_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("order {client_order_id}")))?;
        if !order.status.is_live() {
            debug!(%client_order_id, status = %order.status, "Order not live, nothing to cancel");
            return self.recorded_outcome(order).await;
        }

        if !order.is_paper {
            if let Some(broker_order_id) = &order.broker_order_id {
                self.broker.cancel_order(broker_order_id).await?;
            }
        }
        info!(%client_order_id, "Order cancelled");

        order.status = OrderStatus::Cancelled;
        order.updated_at = self.clock.now();
        let (intent, strategy) = self.context_for(&order).await?;
        Ok(self.finalize(&strategy, &intent, order, None, Vec::new()).await)
    }

    /// Refresh a live order from the broker and settle it when it has
    /// reached an outcome.
    pub async fn reconcile_order(
        &self,
        client_order_id: &ClientOrderId,
    ) -> ExecutorResult<ExecutionReport> {
        let mut order = self
            .tables
            .find_order_by_client_id(client_order_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("order {client_order_id}")))?;
        let broker_order_id = match (&order.broker_order_id, order.status.is_live()) {
            (Some(id), true) if !order.is_paper => id.clone(),
            _ => return self.recorded_outcome(order).await,
        };

        let broker_order = self.broker.get_order(&broker_order_id).await?;
        if broker_order.status == order.status && broker_order.filled_qty == order.filled_qty {
            return self.recorded_outcome(order).await;
        }
        order.status = broker_order.status;
        order.apply_fill(broker_order.filled_qty, broker_order.cumulative_quote_qty);
        order.updated_at = self.clock.now();

        let (intent, strategy) = self.context_for(&order).await?;
        Ok(self.finalize(&strategy, &intent, order, None, Vec::new()).await)
    }

    /// Positions whose stop-loss or take-profit is crossed at the
    /// snapshot's reference price.
    pub async fn check_exits(&self, snapshot: &MarketSnapshot) -> ExecutorResult<Vec<ExitSignal>> {
        let Some(price) = snapshot.reference_price() else {
            return Ok(Vec::new());
        };
        let signals = self
            .tables
            .open_positions(None)
            .await?
            .into_iter()
            .filter(|p| p.symbol == snapshot.symbol)
            .filter_map(|position| {
                let reason = if position.stop_loss_hit(price) {
                    ExitReason::StopLoss
                } else if position.take_profit_hit(price) {
                    ExitReason::TakeProfit
                } else {
                    return None;
                };
                Some(ExitSignal {
                    position,
                    reason,
                    price,
                })
            })
            .collect();
        Ok(signals)
    }

    /// Check every cached symbol and close the positions that hit a bracket.
    pub async fn process_exits(&self) -> Vec<CloseReport> {
        let mut reports = Vec::new();
        for symbol in self.cache.symbols() {
            let Some(snapshot) = self.cache.snapshot(&symbol) else {
                continue;
            };
            let signals = match self.check_exits(&snapshot).await {
                Ok(signals) => signals,
                Err(e) => {
                    warn!(%symbol, error = %e, "Exit check failed");
                    continue;
                }
            };
            for signal in signals {
                info!(
                    position_id = %signal.position.id,
                    symbol = %signal.position.symbol,
                    reason = ?signal.reason,
                    price = %signal.price,
                    "Exit triggered"
                );
                match self.close_position(&signal.position.id, Some(signal.price)).await {
                    Ok(report) => reports.push(report),
                    Err(e) => warn!(position_id = %signal.position.id, error = %e, "Close failed"),
                }
            }
        }
        reports
    }

    /// Close an open position.
    ///
    /// `IN_POSITION → EXITING`, exit order for live positions, realized PnL,
    /// loss recorded against the day and a cooldown after a loss, then
    /// `EXITING → COOLDOWN`. A failed exit order returns the strategy to
    /// `IN_POSITION`.
    pub async fn close_position(
        &self,
        position_id: &str,
        exit_price: Option<Price>,
    ) -> ExecutorResult<CloseReport> {
        let mut position = self
            .tables
            .get_position(position_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("position {position_id}")))?;
        if !position.is_open {
            return Err(ExecutorError::PositionClosed(position_id.to_string()));
        }
        let strategy = self.load_strategy(&position.strategy_id).await?;
        let mut exit = exit_price
            .or_else(|| self.cache.reference_price(&position.symbol))
            .ok_or_else(|| ExecutorError::NoReferencePrice(position.symbol.clone()))?;

        self.machine
            .transition(
                &strategy.id,
                StrategyState::InPosition,
                StrategyState::Exiting,
                json!({ "position_id": position.id }),
            )
            .await?;

        if !position.is_paper && !strategy.is_paper() {
            let request = OrderRequest::closing(&position.symbol, position.side, position.qty);
            match self.submit_live(&request).await {
                Ok(order) => {
                    if let Some(avg) =
                        atlas_core::order::average_fill_price(order.filled_qty, order.cumulative_quote_qty)
                    {
                        exit = avg;
                    }
                }
                Err(e) => {
                    warn!(position_id, error = %e, "Exit order failed, staying in position");
                    if let Err(te) = self
                        .machine
                        .transition(
                            &strategy.id,
                            StrategyState::Exiting,
                            StrategyState::InPosition,
                            json!({ "exit_error": e.to_string() }),
                        )
                        .await
                    {
                        error!(strategy_id = %strategy.id, error = %te, "Failed to restore IN_POSITION");
                    }
                    return Err(e.into());
                }
            }
        }

        let now = self.clock.now();
        let pnl = position
            .close(exit, now)
            .ok_or_else(|| ExecutorError::PositionClosed(position_id.to_string()))?;

        let mut warnings = Vec::new();
        match self.tables.close_position(&position).await {
            Ok(_) => {}
            Err(StoreError::PreconditionFailed { .. }) => {
                return Err(ExecutorError::PositionClosed(position_id.to_string()));
            }
            Err(e) => warn_push(&mut warnings, "position close write failed", &e),
        }
        Metrics::realized_pnl(&position.symbol, pnl.to_f64().unwrap_or_default());
        info!(
            position_id,
            symbol = %position.symbol,
            exit = %exit,
            pnl = %pnl,
            "Position closed"
        );

        if let Err(e) = self.ledger.record_realized_pnl(&strategy.account, pnl).await {
            warn_push(&mut warnings, "realized loss not recorded", &e);
        }

        let cooldown_until = (pnl < Decimal::ZERO && strategy.limits.cooldown_minutes > 0)
            .then(|| now + Duration::minutes(i64::from(strategy.limits.cooldown_minutes)));
        if let Some(until) = cooldown_until {
            if let Err(e) = self.ledger.start_cooldown(&strategy.account, until).await {
                warn_push(&mut warnings, "cooldown not started", &e);
            }
        }

        let strategy_state = self
            .transition_or_warn(
                &strategy.id,
                StrategyState::Exiting,
                StrategyState::Cooldown,
                json!({
                    "position_id": position.id,
                    "realized_pnl_usd": pnl,
                    "cooldown_until": cooldown_until,
                }),
                &mut warnings,
            )
            .await;

        Ok(CloseReport {
            position,
            realized_pnl_usd: pnl,
            cooldown_until,
            strategy_state,
            warnings,
        })
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    async fn load_strategy(&self, strategy_id: &str) -> ExecutorResult<Strategy> {
        self.tables
            .get_strategy(strategy_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("strategy {strategy_id}")))
    }

    async fn context_for(&self, order: &Order) -> ExecutorResult<(Intent, Strategy)> {
        let intent = self
            .tables
            .get_intent(&order.intent_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("intent {}", order.intent_id)))?;
        let strategy = self.load_strategy(&intent.strategy_id).await?;
        Ok((intent, strategy))
    }

    /// Insert the intent row, or advance an existing row to `status` when
    /// that moves its lifecycle forward.
    async fn ensure_intent(&self, intent: &Intent, status: IntentStatus) -> ExecutorResult<()> {
        if let Some(existing) = self.tables.get_intent(&intent.id).await? {
            if existing.status.can_advance_to(status) {
                self.tables.set_intent_status(&intent.id, status).await?;
            }
            return Ok(());
        }
        let mut row = intent.clone();
        row.status = status;
        match self.tables.insert_intent(&row).await {
            Ok(_) | Err(StoreError::Duplicate { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_or_create_order(&self, intent: &Intent, now: DateTime<Utc>) -> ExecutorResult<Order> {
        if let Some(order) = self
            .tables
            .find_order_by_client_id(&intent.client_order_id)
            .await?
        {
            return Ok(order);
        }
        let order = Order::pending(intent, now);
        match self.tables.insert_order(&order).await {
            Ok(_) => {
                debug!(client_order_id = %order.client_order_id, "Pending order recorded");
                Ok(order)
            }
            Err(StoreError::Duplicate { .. }) => self
                .tables
                .find_order_by_client_id(&intent.client_order_id)
                .await?
                .ok_or_else(|| ExecutorError::NotFound(format!("order {}", intent.client_order_id))),
            Err(e) => Err(e.into()),
        }
    }

    async fn recorded_outcome(&self, order: Order) -> ExecutorResult<ExecutionReport> {
        let fill = self.tables.fills_for_order(&order.id).await?.into_iter().next();
        let position = self.tables.position_for_order(&order.id).await?;
        Ok(ExecutionReport {
            order,
            fill,
            position,
            strategy_state: None,
            replayed: true,
            warnings: Vec::new(),
        })
    }

    async fn submit_live(&self, request: &OrderRequest) -> BrokerResult<BrokerOrder> {
        let order = submit_with_retry(self.broker.as_ref(), request, &self.retry).await?;
        if order.status == OrderStatus::Rejected {
            return Err(BrokerError::Rejected(format!(
                "{} reported {}",
                self.broker.name(),
                order.raw_status
            )));
        }
        Ok(order)
    }

    async fn paper_fill(
        &self,
        request: &OrderRequest,
        reference: Option<Price>,
    ) -> BrokerResult<BrokerOrder> {
        let Some(price) = reference else {
            return Err(BrokerError::Rejected(format!(
                "no reference price for {}",
                request.symbol
            )));
        };
        let mut priced = request.clone();
        priced.limit_price = Some(price);
        self.paper.submit_order(&priced).await
    }

    async fn note_fallback(
        &self,
        strategy: &Strategy,
        intent: &Intent,
        cause: &BrokerError,
        filled: bool,
        now: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) {
        warn!(
            strategy_id = %strategy.id,
            client_order_id = %intent.client_order_id,
            broker = self.broker.name(),
            error = %cause,
            filled,
            "Broker failed, falling back to paper fill"
        );
        Metrics::paper_fallback(cause.kind());
        let event = RiskEvent::new(
            &strategy.account,
            RiskCode::PaperFallback,
            format!("{} order {} filled on paper: {cause}", strategy.symbol, intent.client_order_id),
            now,
        );
        self.events.offer(event.clone());
        if let Err(e) = self.tables.insert_risk_event(&event).await {
            warn_push(warnings, "fallback audit event not recorded", &e);
        }
    }

    async fn record_denial(
        &self,
        strategy: &Strategy,
        intent: &Intent,
        denial: &RiskDenial,
        now: DateTime<Utc>,
    ) {
        Metrics::risk_denied(denial.code.as_str());
        info!(
            strategy_id = %strategy.id,
            code = %denial.code,
            reason = %denial.message,
            "Intent denied by risk gate"
        );

        let event = RiskEvent::new(&strategy.account, denial.code, denial.message.clone(), now);
        self.events.offer(event.clone());
        if let Err(e) = self.tables.insert_risk_event(&event).await {
            error!(error = %e, "Failed to record risk event");
        }
        if let Err(e) = self.ensure_intent(intent, IntentStatus::Denied).await {
            error!(error = %e, "Failed to record denied intent");
        }
        if let Err(e) = self
            .machine
            .transition(
                &strategy.id,
                StrategyState::Triggered,
                StrategyState::Idle,
                json!({ "denied": denial.code }),
            )
            .await
        {
            debug!(strategy_id = %strategy.id, error = %e, "Denied strategy not returned to IDLE");
        }
    }

    /// Persist the broker outcome and drive the strategy (steps 7 and 8).
    async fn finalize(
        &self,
        strategy: &Strategy,
        intent: &Intent,
        order: Order,
        reference: Option<Price>,
        mut warnings: Vec<String>,
    ) -> ExecutionReport {
        if let Err(e) = self.tables.update_order(&order).await {
            warn_push(&mut warnings, "order update failed", &e);
        }
        Metrics::order_recorded(order.status.as_str(), order.is_paper);

        let mut fill = None;
        let mut position = None;
        let mut strategy_state = None;

        if order.has_fill() && order.status != OrderStatus::PartiallyFilled {
            let now = self.clock.now();
            let price = order
                .filled_avg_price
                .or(reference)
                .unwrap_or(Price::ZERO);

            let existing = match self.tables.position_for_order(&order.id).await {
                Ok(existing) => existing,
                Err(e) => {
                    warn_push(&mut warnings, "position lookup failed", &e);
                    None
                }
            };
            if existing.is_some() {
                return ExecutionReport {
                    order,
                    fill: None,
                    position: existing,
                    strategy_state: None,
                    replayed: true,
                    warnings,
                };
            }

            let new_fill = Fill {
                id: Uuid::new_v4().to_string(),
                order_id: order.id.clone(),
                price,
                qty: order.filled_qty,
                fee: Decimal::ZERO,
                filled_at: now,
            };
            if let Err(e) = self.tables.insert_fill(&new_fill).await {
                warn_push(&mut warnings, "fill not recorded", &e);
            }

            let new_position = Position {
                id: Uuid::new_v4().to_string(),
                strategy_id: strategy.id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                qty: order.filled_qty,
                entry_price: price,
                stop_loss_price: intent.stop_loss_price,
                take_profit_price: intent.take_profit_price,
                entry_order_id: order.id.clone(),
                is_open: true,
                is_paper: order.is_paper,
                opened_at: now,
                closed_at: None,
                exit_price: None,
                realized_pnl_usd: None,
            };
            if let Err(e) = self.tables.insert_position(&new_position).await {
                warn_push(&mut warnings, "position not recorded", &e);
            }

            self.set_intent_status_or_warn(&intent.id, IntentStatus::Filled, &mut warnings)
                .await;
            if let Err(e) = self.ledger.record_trade(&strategy.account).await {
                warn_push(&mut warnings, "trade not counted", &e);
            }
            strategy_state = self
                .transition_or_warn(
                    &strategy.id,
                    StrategyState::Ordering,
                    StrategyState::InPosition,
                    json!({ "position_id": new_position.id, "order_id": order.id }),
                    &mut warnings,
                )
                .await;

            info!(
                strategy_id = %strategy.id,
                symbol = %order.symbol,
                side = %order.side,
                qty = %order.filled_qty,
                price = %price,
                is_paper = order.is_paper,
                "Order filled, position opened"
            );
            fill = Some(new_fill);
            position = Some(new_position);
        } else if order.status.is_live() {
            info!(
                client_order_id = %order.client_order_id,
                status = %order.status,
                "Order live at broker, awaiting fill"
            );
        } else {
            self.set_intent_status_or_warn(&intent.id, IntentStatus::Failed, &mut warnings)
                .await;
            strategy_state = self
                .transition_or_warn(
                    &strategy.id,
                    StrategyState::Ordering,
                    StrategyState::Idle,
                    json!({ "order_status": order.status, "error": order.error_message }),
                    &mut warnings,
                )
                .await;
        }

        ExecutionReport {
            order,
            fill,
            position,
            strategy_state,
            replayed: false,
            warnings,
        }
    }

    async fn set_intent_status_or_warn(
        &self,
        intent_id: &str,
        status: IntentStatus,
        warnings: &mut Vec<String>,
    ) {
        if let Err(e) = self.tables.set_intent_status(intent_id, status).await {
            warn_push(warnings, "intent status not updated", &e);
        }
    }

    async fn transition_or_warn(
        &self,
        strategy_id: &str,
        from: StrategyState,
        to: StrategyState,
        metadata: serde_json::Value,
        warnings: &mut Vec<String>,
    ) -> Option<StrategyState> {
        match self.machine.transition(strategy_id, from, to, metadata).await {
            Ok(strategy) => Some(strategy.current_state),
            Err(e) => {
                warn_push(warnings, &format!("transition {from} -> {to} failed"), &e);
                None
            }
        }
    }
}

fn validate(intent: &Intent) -> ExecutorResult<()> {
    intent
        .validate()
        .map_err(|e| ExecutorError::InvalidOrder(e.to_string()))
}

fn warn_push(warnings: &mut Vec<String>, what: &str, err: &dyn std::fmt::Display) {
    error!(error = %err, "{what}");
    warnings.push(format!("{what}: {err}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ScriptedBroker;
    use atlas_core::{
        BookLevel, ManualClock, OrderSide, StrategyLimits, StrategyMode,
    };
    use atlas_feed::MarketEvent;
    use atlas_store::{MemoryStore, Store, Table};
    use atlas_strategy::StrategyError;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-05T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Harness {
        store: Arc<MemoryStore>,
        tables: Tables,
        broker: Arc<ScriptedBroker>,
        cache: Arc<MarketSnapshotCache>,
        ledger: Arc<RiskLedger>,
        clock: Arc<ManualClock>,
        pipeline: OrderExecutionPipeline,
    }

    async fn harness(mode: StrategyMode, state: StrategyState) -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new());
        let tables = Tables::new(store.clone());
        let mut strategy = Strategy::new("s1", "acct", "BTC", mode, StrategyLimits::default());
        strategy.current_state = state;
        tables.insert_strategy(&strategy).await.unwrap();

        let cache = Arc::new(MarketSnapshotCache::new(clock.clone()));
        let ledger = Arc::new(RiskLedger::new(tables.clone(), clock.clone()));
        let machine = StrategyStateMachine::new(tables.clone(), clock.clone());
        let broker = Arc::new(ScriptedBroker::new());
        let pipeline = OrderExecutionPipeline::new(
            tables.clone(),
            broker.clone(),
            cache.clone(),
            ledger.clone(),
            machine,
            clock.clone(),
        )
        .with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        });
        Harness {
            store,
            tables,
            broker,
            cache,
            ledger,
            clock,
            pipeline,
        }
    }

    fn intent() -> Intent {
        Intent::new("s1", "BTC", OrderSide::Buy, dec!(250))
            .with_intended_price(Price::new(dec!(100)))
            .with_stop_loss(Price::new(dec!(95)))
            .with_take_profit(Price::new(dec!(110)))
    }

    fn seed_mid(cache: &MarketSnapshotCache, bid: Decimal, ask: Decimal) {
        cache.apply(
            MarketEvent::Book {
                symbol: "BTC".to_string(),
                bids: vec![BookLevel::new(Price::new(bid), Size::new(dec!(10)))],
                asks: vec![BookLevel::new(Price::new(ask), Size::new(dec!(10)))],
                time_ms: None,
            },
            t0(),
        );
    }

    async fn state_of(h: &Harness) -> StrategyState {
        h.tables.require_strategy("s1").await.unwrap().current_state
    }

    #[tokio::test]
    async fn test_live_fill_opens_position() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        let intent = intent();
        h.broker.push_submit(Ok(BrokerOrder {
            broker_order_id: "b-1".to_string(),
            client_order_id: intent.client_order_id.clone(),
            status: OrderStatus::Filled,
            filled_qty: Size::new(dec!(2.5)),
            cumulative_quote_qty: dec!(251),
            raw_status: "filled".to_string(),
        }));

        let report = h.pipeline.execute(intent.clone()).await.unwrap();
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(!report.order.is_paper);
        assert_eq!(report.order.status, OrderStatus::Filled);
        assert_eq!(report.order.broker_order_id.as_deref(), Some("b-1"));
        assert_eq!(report.order.filled_avg_price, Some(Price::new(dec!(100.4))));
        assert_eq!(report.strategy_state, Some(StrategyState::InPosition));

        let position = report.position.unwrap();
        assert_eq!(position.entry_price, Price::new(dec!(100.4)));
        assert_eq!(position.stop_loss_price, Some(Price::new(dec!(95))));
        assert!(position.is_open);

        assert_eq!(h.tables.fills_for_order(&report.order.id).await.unwrap().len(), 1);
        assert_eq!(
            h.tables.get_intent(&intent.id).await.unwrap().unwrap().status,
            IntentStatus::Filled
        );
        assert_eq!(h.ledger.current("acct").await.unwrap().daily_trade_count, 1);
        assert_eq!(state_of(&h).await, StrategyState::InPosition);
    }

    #[tokio::test]
    async fn test_broker_error_falls_back_to_paper_at_intended_price() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        h.broker
            .push_submit(Err(BrokerError::GeoBlocked("restricted".to_string())));

        let report = h.pipeline.execute(intent()).await.unwrap();
        assert_eq!(report.order.status, OrderStatus::Filled);
        assert!(report.order.is_paper);
        assert_eq!(report.order.filled_avg_price, Some(Price::new(dec!(100))));
        assert_eq!(report.order.filled_qty, Size::new(dec!(2.5)));
        assert!(report.order.error_message.is_some());
        assert!(report.position.unwrap().is_paper);

        let events = h.tables.recent_risk_events("acct", 10).await.unwrap();
        assert_eq!(events[0].code, RiskCode::PaperFallback);
        assert_eq!(
            h.pipeline.event_board().current("acct").unwrap().code,
            RiskCode::PaperFallback
        );
    }

    #[tokio::test]
    async fn test_fallback_uses_cached_mid_without_intended_price() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        seed_mid(&h.cache, dec!(99), dec!(101));
        h.broker.push_submit(Err(BrokerError::Rejected("closed".to_string())));

        let intent = Intent::new("s1", "BTC", OrderSide::Buy, dec!(300));
        let report = h.pipeline.execute(intent).await.unwrap();
        assert!(report.order.is_paper);
        assert_eq!(report.order.filled_avg_price, Some(Price::new(dec!(100))));
        assert_eq!(report.order.filled_qty, Size::new(dec!(3)));
    }

    #[tokio::test]
    async fn test_no_reference_price_records_rejected() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        h.broker
            .push_submit(Err(BrokerError::Transport("down".to_string())));
        h.broker
            .push_submit(Err(BrokerError::Transport("down".to_string())));

        let intent = Intent::new("s1", "BTC", OrderSide::Buy, dec!(300));
        let report = h.pipeline.execute(intent.clone()).await.unwrap();
        assert_eq!(report.order.status, OrderStatus::Rejected);
        assert_eq!(report.order.filled_avg_price, None);
        assert!(report.position.is_none());
        assert_eq!(report.strategy_state, Some(StrategyState::Idle));
        assert_eq!(h.broker.requests().len(), 2);
        assert_eq!(
            h.tables.get_intent(&intent.id).await.unwrap().unwrap().status,
            IntentStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_same_intent_twice_creates_one_order() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        let intent = intent();

        let first = h.pipeline.execute(intent.clone()).await.unwrap();
        let second = h.pipeline.execute(intent.clone()).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.order.id, second.order.id);
        assert_eq!(h.broker.requests().len(), 1);
        assert_eq!(h.tables.orders_for_intent(&intent.id).await.unwrap().len(), 1);
        assert_eq!(h.store.count(Table::Positions), 1);
        assert_eq!(second.position.unwrap().id, first.position.unwrap().id);
    }

    #[tokio::test]
    async fn test_zero_fill_leaves_average_unset_and_returns_idle() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        let intent = intent();
        h.broker.push_submit(Ok(BrokerOrder {
            broker_order_id: "b-2".to_string(),
            client_order_id: intent.client_order_id.clone(),
            status: OrderStatus::Expired,
            filled_qty: Size::ZERO,
            cumulative_quote_qty: Decimal::ZERO,
            raw_status: "EXPIRED".to_string(),
        }));

        let report = h.pipeline.execute(intent).await.unwrap();
        assert_eq!(report.order.status, OrderStatus::Expired);
        assert_eq!(report.order.filled_avg_price, None);
        assert!(report.fill.is_none());
        assert_eq!(state_of(&h).await, StrategyState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_intent_has_no_side_effects() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        let mut changes = h.store.subscribe_changes(Table::Orders, None);
        let bad = Intent::new("s1", "BTC", OrderSide::Buy, Decimal::ZERO);

        let err = h.pipeline.execute(bad).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidOrder(_)));
        assert!(changes.try_next().is_none());
        assert!(h.broker.requests().is_empty());
        assert_eq!(state_of(&h).await, StrategyState::Triggered);
    }

    #[tokio::test]
    async fn test_risk_denial_records_event_and_idles_strategy() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        h.ledger
            .start_cooldown("acct", t0() + Duration::minutes(5))
            .await
            .unwrap();

        let intent = intent();
        let err = h.pipeline.execute(intent.clone()).await.unwrap_err();
        match err {
            ExecutorError::RiskDenied { code, .. } => assert_eq!(code, RiskCode::CooldownActive),
            other => panic!("expected RiskDenied, got {other:?}"),
        }
        assert!(h.broker.requests().is_empty());
        assert_eq!(h.store.count(Table::Orders), 0);
        assert_eq!(
            h.tables.get_intent(&intent.id).await.unwrap().unwrap().status,
            IntentStatus::Denied
        );
        assert_eq!(
            h.tables.recent_risk_events("acct", 1).await.unwrap()[0].code,
            RiskCode::CooldownActive
        );
        assert_eq!(state_of(&h).await, StrategyState::Idle);
    }

    #[tokio::test]
    async fn test_execute_requires_triggered_strategy() {
        let h = harness(StrategyMode::Live, StrategyState::Idle).await;
        let err = h.pipeline.execute(intent()).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::Strategy(StrategyError::StateConflict { .. })
        ));
        assert!(h.broker.requests().is_empty());
    }

    #[tokio::test]
    async fn test_paper_strategy_never_calls_broker() {
        let h = harness(StrategyMode::Paper, StrategyState::Triggered).await;
        let report = h.pipeline.execute(intent()).await.unwrap();
        assert!(report.order.is_paper);
        assert_eq!(report.order.status, OrderStatus::Filled);
        assert!(h.broker.requests().is_empty());
    }

    #[tokio::test]
    async fn test_pending_intent_row_is_advanced() {
        let h = harness(StrategyMode::Paper, StrategyState::Triggered).await;
        let intent = intent();
        h.tables.insert_intent(&intent).await.unwrap();

        h.pipeline.execute(intent.clone()).await.unwrap();
        let stored = h.tables.get_intent(&intent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Filled);
    }

    #[tokio::test]
    async fn test_live_order_awaits_then_cancel_returns_idle() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        let intent = intent();
        h.broker.push_submit(Ok(BrokerOrder {
            broker_order_id: "b-3".to_string(),
            client_order_id: intent.client_order_id.clone(),
            status: OrderStatus::Submitted,
            filled_qty: Size::ZERO,
            cumulative_quote_qty: Decimal::ZERO,
            raw_status: "accepted".to_string(),
        }));

        let report = h.pipeline.execute(intent.clone()).await.unwrap();
        assert_eq!(report.order.status, OrderStatus::Submitted);
        assert_eq!(state_of(&h).await, StrategyState::Ordering);

        let cancelled = h
            .pipeline
            .cancel_after_submit(&intent.client_order_id)
            .await
            .unwrap();
        assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
        assert_eq!(h.broker.cancels(), vec!["b-3".to_string()]);
        assert_eq!(state_of(&h).await, StrategyState::Idle);
    }

    #[tokio::test]
    async fn test_reconcile_settles_live_order() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        let intent = intent();
        let accepted = BrokerOrder {
            broker_order_id: "b-4".to_string(),
            client_order_id: intent.client_order_id.clone(),
            status: OrderStatus::Submitted,
            filled_qty: Size::ZERO,
            cumulative_quote_qty: Decimal::ZERO,
            raw_status: "accepted".to_string(),
        };
        h.broker.push_submit(Ok(accepted.clone()));
        h.pipeline.execute(intent.clone()).await.unwrap();

        h.broker.push_lookup(Ok(BrokerOrder {
            status: OrderStatus::Filled,
            filled_qty: Size::new(dec!(2)),
            cumulative_quote_qty: dec!(200),
            raw_status: "filled".to_string(),
            ..accepted
        }));
        let report = h
            .pipeline
            .reconcile_order(&intent.client_order_id)
            .await
            .unwrap();
        assert_eq!(report.order.status, OrderStatus::Filled);
        assert_eq!(report.position.unwrap().qty, Size::new(dec!(2)));
        assert_eq!(state_of(&h).await, StrategyState::InPosition);
    }

    #[tokio::test]
    async fn test_losing_close_records_loss_and_cooldown() {
        let h = harness(StrategyMode::Paper, StrategyState::Triggered).await;
        let opened = h.pipeline.execute(intent()).await.unwrap();
        let position = opened.position.unwrap();

        h.clock.advance(Duration::minutes(1));
        let report = h
            .pipeline
            .close_position(&position.id, Some(Price::new(dec!(96))))
            .await
            .unwrap();
        assert_eq!(report.realized_pnl_usd, dec!(-10));
        assert!(!report.position.is_open);
        assert_eq!(report.strategy_state, Some(StrategyState::Cooldown));

        let risk = h.ledger.current("acct").await.unwrap();
        assert_eq!(risk.daily_loss_usd, dec!(10));
        assert_eq!(
            risk.cooldown_until,
            Some(t0() + Duration::minutes(1) + Duration::minutes(15))
        );

        let again = h
            .pipeline
            .close_position(&position.id, Some(Price::new(dec!(96))))
            .await
            .unwrap_err();
        assert!(matches!(again, ExecutorError::PositionClosed(_)));
    }

    #[tokio::test]
    async fn test_profitable_close_has_no_cooldown() {
        let h = harness(StrategyMode::Paper, StrategyState::Triggered).await;
        let position = h.pipeline.execute(intent()).await.unwrap().position.unwrap();
        let report = h
            .pipeline
            .close_position(&position.id, Some(Price::new(dec!(104))))
            .await
            .unwrap();
        assert_eq!(report.realized_pnl_usd, dec!(10));
        assert_eq!(report.cooldown_until, None);
        assert_eq!(h.ledger.current("acct").await.unwrap().daily_loss_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_failed_exit_order_restores_in_position() {
        let h = harness(StrategyMode::Live, StrategyState::Triggered).await;
        let position = h.pipeline.execute(intent()).await.unwrap().position.unwrap();

        h.broker.push_submit(Err(BrokerError::Rejected("halted".to_string())));
        let err = h
            .pipeline
            .close_position(&position.id, Some(Price::new(dec!(101))))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Broker(BrokerError::Rejected(_))));
        assert_eq!(state_of(&h).await, StrategyState::InPosition);
        assert!(h.tables.require_position(&position.id).await.unwrap().is_open);
    }

    #[tokio::test]
    async fn test_check_exits_detects_brackets() {
        let h = harness(StrategyMode::Paper, StrategyState::Triggered).await;
        h.pipeline.execute(intent()).await.unwrap();

        seed_mid(&h.cache, dec!(99), dec!(101));
        let snapshot = h.cache.snapshot("BTC").unwrap();
        assert!(h.pipeline.check_exits(&snapshot).await.unwrap().is_empty());

        let mut crashed = snapshot.clone();
        crashed.mark_price = Some(Price::new(dec!(94)));
        let signals = h.pipeline.check_exits(&crashed).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].reason, ExitReason::StopLoss);

        let mut rallied = snapshot;
        rallied.mark_price = Some(Price::new(dec!(111)));
        assert_eq!(
            h.pipeline.check_exits(&rallied).await.unwrap()[0].reason,
            ExitReason::TakeProfit
        );
    }
}
