//! Main application orchestration.
//!
//! Coordinates all components:
//! - WebSocket transport and market subscriptions feeding the snapshot cache
//! - Per-strategy evaluation loops emitting intents
//! - The execution pipeline consuming intents
//! - Bracket exits, live-order and daily-loss reconciliation, momentum sampling
//! - Prometheus endpoint

use crate::config::{AppConfig, BrokerKind};
use crate::error::AppResult;
use crate::metrics_server::run_metrics_server;
use crate::momentum::MomentumDetector;
use atlas_core::{ChannelType, Clock, Intent, OrderStatus, SubscriptionSpec, SystemClock};
use atlas_executor::{
    AlpacaBroker, Broker, ExecutorError, OrderExecutionPipeline, PaperBroker,
};
use atlas_feed::MarketSnapshotCache;
use atlas_risk::{RiskEventBoard, RiskLedger};
use atlas_store::{read_journal, JournalWriter, MemoryStore, Tables};
use atlas_strategy::{StrategyEvaluator, StrategyStateMachine, ThresholdAgent};
use atlas_telemetry::Metrics;
use atlas_ws::{
    ConnectionConfig, HandlerError, StreamFrame, StreamTransport, SubscriptionRegistry,
    SubscriptionToken, TransportEvent,
};
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channels streamed per market symbol.
const MARKET_CHANNELS: [ChannelType; 3] = [
    ChannelType::L2Book,
    ChannelType::Bbo,
    ChannelType::ActiveAssetCtx,
];

/// Main application.
pub struct Application {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    tables: Tables,
    cache: Arc<MarketSnapshotCache>,
    ledger: Arc<RiskLedger>,
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<StreamTransport>,
    evaluator: Arc<StrategyEvaluator>,
    pipeline: Arc<OrderExecutionPipeline>,
    shutdown: CancellationToken,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(open_store(&config, clock.clone())?);
        let tables = Tables::new(store);

        let cache = Arc::new(MarketSnapshotCache::new(clock.clone()));
        let ledger = Arc::new(RiskLedger::new(tables.clone(), clock.clone()));
        let events = Arc::new(RiskEventBoard::new());

        let paper = Arc::new(
            PaperBroker::new(config.broker.paper_cash).with_market_data(cache.clone()),
        );
        let broker: Arc<dyn Broker> = match config.broker.kind {
            BrokerKind::Paper => paper.clone(),
            BrokerKind::Alpaca => Arc::new(AlpacaBroker::new(config.broker.alpaca()?)?),
        };
        info!(broker = broker.name(), "Broker configured");

        let agent_configs: HashMap<_, _> = config
            .strategies
            .iter()
            .map(|s| (s.id.clone(), s.agent.clone()))
            .collect();
        let evaluator = Arc::new(StrategyEvaluator::new(
            tables.clone(),
            cache.clone(),
            ledger.clone(),
            Arc::new(ThresholdAgent::new()),
            StrategyStateMachine::new(tables.clone(), clock.clone()),
            clock.clone(),
            agent_configs,
        ));

        let pipeline = Arc::new(
            OrderExecutionPipeline::new(
                tables.clone(),
                broker,
                cache.clone(),
                ledger.clone(),
                StrategyStateMachine::new(tables.clone(), clock.clone()),
                clock.clone(),
            )
            .with_retry(config.broker.retry.clone())
            .with_event_board(events)
            .with_paper_broker(paper),
        );

        let registry = Arc::new(SubscriptionRegistry::new());
        let ws_config: ConnectionConfig = config.websocket.clone().into();
        let transport = Arc::new(StreamTransport::new(ws_config, registry.clone()));

        Ok(Self {
            config,
            clock,
            tables,
            cache,
            ledger,
            registry,
            transport,
            evaluator,
            pipeline,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn cache(&self) -> &Arc<MarketSnapshotCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<RiskLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<OrderExecutionPipeline> {
        &self.pipeline
    }

    pub fn evaluator(&self) -> &Arc<StrategyEvaluator> {
        &self.evaluator
    }

    /// Cancelling the token stops `run`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Insert configured strategies that have no row yet and refresh the
    /// configured columns of the others. Lifecycle state is kept.
    pub async fn sync_strategies(&self) -> AppResult<usize> {
        for cfg in &self.config.strategies {
            let desired = cfg.to_strategy();
            match self.tables.get_strategy(&cfg.id).await? {
                None => {
                    self.tables.insert_strategy(&desired).await?;
                    info!(strategy_id = %cfg.id, symbol = %desired.symbol, mode = %desired.mode, "Strategy registered");
                }
                Some(existing) => {
                    let stored = self.tables.update_strategy_config(&desired).await?;
                    info!(
                        strategy_id = %cfg.id,
                        state = %existing.current_state,
                        mode = %stored.mode,
                        "Strategy restored"
                    );
                }
            }
        }
        Ok(self.config.strategies.len())
    }

    /// Register cache handlers for every streamed symbol.
    pub fn subscribe_markets(&self) -> AppResult<Vec<SubscriptionToken>> {
        let mut tokens = Vec::new();
        for symbol in self.config.stream_symbols() {
            for channel in MARKET_CHANNELS {
                tokens.push(self.registry.subscribe(
                    SubscriptionSpec::coin(channel, symbol.as_str()),
                    cache_handler(self.cache.clone()),
                )?);
            }
        }
        if self.config.subscribe_all_mids {
            tokens.push(
                self.registry
                    .subscribe(SubscriptionSpec::all_mids(), cache_handler(self.cache.clone()))?,
            );
        }
        Metrics::subscriptions_active(self.registry.len());
        info!(
            keys = self.registry.len(),
            symbols = ?self.config.stream_symbols(),
            "Market subscriptions registered"
        );
        Ok(tokens)
    }

    /// Run until ctrl-c, the shutdown token, or an unreachable stream.
    pub async fn run(self) -> AppResult<()> {
        let strategies = self.sync_strategies().await?;
        let tokens = self.subscribe_markets()?;
        info!(strategies, "Starting application");

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let transport = self.transport.clone();
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = transport.connect().await {
                error!(error = %e, "Market stream stopped");
                shutdown.cancel();
            }
        }));

        tasks.push(tokio::spawn(track_transport(
            self.transport.events(),
            self.registry.clone(),
            self.shutdown.clone(),
        )));

        if self.config.telemetry.metrics_port != 0 {
            let port = self.config.telemetry.metrics_port;
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_metrics_server(port, shutdown).await {
                    error!(port, error = %e, "Metrics endpoint failed");
                }
            }));
        }

        let (intent_tx, intent_rx) = mpsc::channel::<Intent>(self.config.execution.intent_queue);
        for cfg in &self.config.strategies {
            tasks.push(tokio::spawn(self.evaluator.clone().run(
                cfg.id.clone(),
                Duration::from_secs(cfg.evaluation_interval_secs),
                intent_tx.clone(),
                self.shutdown.clone(),
            )));
        }
        drop(intent_tx);
        tasks.push(tokio::spawn(execute_intents(
            self.pipeline.clone(),
            intent_rx,
            self.shutdown.clone(),
        )));

        let mut exit_ticker = ticker(self.config.execution.exit_check_interval_ms);
        let mut reconcile_ticker = ticker(self.config.execution.reconcile_interval_ms);
        let mut pattern_ticker = ticker(self.config.patterns.sample_interval_ms);
        let mut momentum = MomentumDetector::new(self.config.patterns.clone());

        info!("Entering main event loop");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }

                _ = exit_ticker.tick() => {
                    for report in self.pipeline.process_exits().await {
                        info!(
                            position_id = %report.position.id,
                            pnl = %report.realized_pnl_usd,
                            cooldown_until = ?report.cooldown_until,
                            "Position exited"
                        );
                    }
                }

                _ = reconcile_ticker.tick() => {
                    self.reconcile_live_orders().await;
                    self.reconcile_daily_losses().await;
                }

                _ = pattern_ticker.tick() => {
                    self.sample_patterns(&mut momentum);
                }
            }
        }

        self.shutdown.cancel();
        self.transport.disconnect();
        for token in &tokens {
            self.registry.unsubscribe(token);
        }
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Task did not stop within 5s");
            }
        }
        info!("Shutdown complete");
        Ok(())
    }

    /// Refresh orders still live at the broker; cancel those past the
    /// configured timeout.
    pub async fn reconcile_live_orders(&self) {
        let timeout_secs = self.config.execution.order_timeout_secs;
        let now = self.clock.now();

        for status in [OrderStatus::Pending, OrderStatus::Submitted, OrderStatus::PartiallyFilled] {
            let orders = match self.tables.orders_with_status(status).await {
                Ok(orders) => orders,
                Err(e) => {
                    warn!(%status, error = %e, "Live order query failed");
                    continue;
                }
            };
            for order in orders.into_iter().filter(|o| !o.is_paper) {
                let age = now - order.created_at;
                let expired = timeout_secs > 0
                    && age > ChronoDuration::seconds(i64::try_from(timeout_secs).unwrap_or(i64::MAX));
                let result = if expired {
                    info!(client_order_id = %order.client_order_id, age_secs = age.num_seconds(), "Cancelling stale order");
                    self.pipeline.cancel_after_submit(&order.client_order_id).await
                } else {
                    self.pipeline.reconcile_order(&order.client_order_id).await
                };
                match result {
                    Ok(report) if report.order.status != order.status => info!(
                        client_order_id = %order.client_order_id,
                        from = %order.status,
                        to = %report.order.status,
                        "Order reconciled"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(client_order_id = %order.client_order_id, error = %e, "Order reconcile failed"),
                }
            }
        }
    }

    /// Re-derive each configured account's daily loss from its closed
    /// positions, correcting drift from missed or partial updates.
    pub async fn reconcile_daily_losses(&self) {
        let mut accounts: Vec<&str> = self
            .config
            .strategies
            .iter()
            .map(|s| s.account.as_str())
            .collect();
        accounts.sort_unstable();
        accounts.dedup();
        for account in accounts {
            if let Err(e) = self.ledger.reconcile_account(account).await {
                warn!(account, error = %e, "Daily loss reconcile failed");
            }
        }
    }

    fn sample_patterns(&self, momentum: &mut MomentumDetector) {
        let now = self.clock.now();
        for symbol in self.cache.symbols() {
            let Some(mid) = self.cache.mid_price(&symbol) else {
                continue;
            };
            if let Some(pattern) = momentum.observe(&symbol, mid, now) {
                debug!(%symbol, side = %pattern.side, strength = %pattern.strength, "Momentum pattern");
                self.evaluator.push_pattern(&symbol, pattern);
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn open_store(config: &AppConfig, clock: Arc<dyn Clock>) -> AppResult<MemoryStore> {
    let store = MemoryStore::with_clock(clock);
    let Some(dir) = config.persistence.journal_dir.as_deref() else {
        info!("No journal directory configured, store is memory-only");
        return Ok(store);
    };
    let journal = JournalWriter::new(dir)?;
    let replayed = store.replay(read_journal(dir)?);
    info!(dir, replayed, "Store restored from journal");
    Ok(store.with_journal(journal))
}

fn ticker(period_ms: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

/// Cache ingest wrapped with dispatch and decode metrics.
fn cache_handler(
    cache: Arc<MarketSnapshotCache>,
) -> impl Fn(&StreamFrame) -> Result<(), HandlerError> + Send + Sync + 'static {
    move |frame: &StreamFrame| -> Result<(), HandlerError> {
        let channel = frame.channel_type.as_str();
        match cache.ingest(frame) {
            Ok(_) => {
                Metrics::frame_dispatched(channel);
                Ok(())
            }
            Err(e) => {
                Metrics::decode_error(channel);
                Err(Box::new(e))
            }
        }
    }
}

async fn track_transport(
    mut events: broadcast::Receiver<TransportEvent>,
    registry: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Connected { replayed }) => {
                Metrics::ws_connected();
                Metrics::subscriptions_active(registry.len());
                info!(replayed, "Market stream connected");
            }
            Ok(TransportEvent::Disconnected { reason }) => {
                Metrics::ws_disconnected();
                warn!(%reason, "Market stream disconnected");
            }
            Ok(TransportEvent::Reconnecting { attempt, delay_ms }) => {
                Metrics::ws_reconnect("disconnected");
                debug!(attempt, delay_ms, "Market stream reconnecting");
            }
            Ok(TransportEvent::Unreachable { attempts }) => {
                error!(attempts, "Market stream unreachable");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Transport event observer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn execute_intents(
    pipeline: Arc<OrderExecutionPipeline>,
    mut intents: mpsc::Receiver<Intent>,
    shutdown: CancellationToken,
) {
    loop {
        let intent = tokio::select! {
            _ = shutdown.cancelled() => return,
            intent = intents.recv() => match intent {
                Some(intent) => intent,
                None => return,
            },
        };
        let strategy_id = intent.strategy_id.clone();
        match pipeline.execute(intent).await {
            Ok(report) => {
                for warning in &report.warnings {
                    warn!(%strategy_id, %warning, "Execution warning");
                }
                info!(
                    %strategy_id,
                    client_order_id = %report.order.client_order_id,
                    status = %report.order.status,
                    is_paper = report.order.is_paper,
                    replayed = report.replayed,
                    "Intent executed"
                );
            }
            Err(ExecutorError::RiskDenied { code, message, .. }) => {
                info!(%strategy_id, %code, %message, "Intent denied");
            }
            Err(e) => error!(%strategy_id, error = %e, "Intent execution failed"),
        }
    }
}
