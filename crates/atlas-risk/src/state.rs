//! Daily risk bookkeeping.
//!
//! One `RiskState` row per account and UTC trading day. The row for a new
//! day is created lazily on first read; the kill switch and any unexpired
//! cooldown carry over from the account's previous row.

use crate::error::RiskResult;
use atlas_core::{Clock, Position, RiskState};
use atlas_store::{StoreError, Tables};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Risk row manager.
///
/// Read-modify-write cycles are serialized per ledger so concurrent
/// updates for the same account never lose increments.
pub struct RiskLedger {
    tables: Tables,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

/// UTC trading day of `ts`.
pub fn trading_day(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}

/// `[start, end)` of a trading day.
pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}

impl RiskLedger {
    pub fn new(tables: Tables, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Today's row, created on first read.
    pub async fn current(&self, account: &str) -> RiskResult<RiskState> {
        let now = self.clock.now();
        self.load(account, trading_day(now), now).await
    }

    async fn load(&self, account: &str, day: NaiveDate, now: DateTime<Utc>) -> RiskResult<RiskState> {
        let key = RiskState::key(account, day);
        if let Some(state) = self.tables.get_risk_state(&key).await? {
            return Ok(state);
        }

        let state = match self.tables.latest_risk_state_before(account, day).await? {
            Some(previous) => {
                debug!(
                    account,
                    from = %previous.trading_day,
                    kill_switch = previous.kill_switch_active,
                    "Carrying risk state into new trading day"
                );
                RiskState::carry_over(&previous, day, now)
            }
            None => RiskState::fresh(account, day, now),
        };

        match self.tables.insert_risk_state(&state).await {
            Ok(_) => {
                info!(account, day = %day, "Created risk state row");
                Ok(state)
            }
            // Another writer created the row first.
            Err(StoreError::Duplicate { .. }) => Ok(self
                .tables
                .get_risk_state(&key)
                .await?
                .unwrap_or(state)),
            Err(e) => Err(e.into()),
        }
    }

    async fn modify<F>(&self, account: &str, f: F) -> RiskResult<RiskState>
    where
        F: FnOnce(&mut RiskState, DateTime<Utc>),
    {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let mut state = self.load(account, trading_day(now), now).await?;
        f(&mut state, now);
        state.updated_at = now;
        Ok(self.tables.update_risk_state(&state).await?)
    }

    /// Count one executed trade.
    pub async fn record_trade(&self, account: &str) -> RiskResult<RiskState> {
        self.modify(account, |state, _| {
            state.daily_trade_count = state.daily_trade_count.saturating_add(1);
        })
        .await
    }

    /// Record realized PnL. Only losses change the row; gains never
    /// reduce the accumulated loss.
    pub async fn record_realized_pnl(&self, account: &str, pnl_usd: Decimal) -> RiskResult<RiskState> {
        if pnl_usd >= Decimal::ZERO {
            return self.current(account).await;
        }
        self.modify(account, |state, _| {
            state.daily_loss_usd += pnl_usd.abs();
        })
        .await
    }

    pub async fn activate_kill_switch(&self, account: &str, reason: &str) -> RiskResult<RiskState> {
        warn!(account, reason, "Kill switch activated");
        let reason = reason.to_string();
        self.modify(account, move |state, _| {
            state.kill_switch_active = true;
            state.kill_switch_reason = Some(reason);
        })
        .await
    }

    pub async fn clear_kill_switch(&self, account: &str) -> RiskResult<RiskState> {
        info!(account, "Kill switch cleared");
        self.modify(account, |state, _| {
            state.kill_switch_active = false;
            state.kill_switch_reason = None;
        })
        .await
    }

    pub async fn start_cooldown(&self, account: &str, until: DateTime<Utc>) -> RiskResult<RiskState> {
        debug!(account, until = %until, "Cooldown started");
        self.modify(account, move |state, _| {
            // Never shorten an active cooldown.
            state.cooldown_until = Some(state.cooldown_until.map_or(until, |cur| cur.max(until)));
        })
        .await
    }

    pub async fn clear_cooldown(&self, account: &str) -> RiskResult<RiskState> {
        self.modify(account, |state, _| state.cooldown_until = None)
            .await
    }

    /// Re-derive today's loss from the closed positions passed in.
    ///
    /// Only positions closed during today's trading day count, and only
    /// their losses. The stored value is replaced by the derived one.
    pub async fn reconcile_daily_loss(
        &self,
        account: &str,
        closed_positions: &[Position],
    ) -> RiskResult<RiskState> {
        let now = self.clock.now();
        let (start, end) = day_bounds(trading_day(now));
        let derived: Decimal = closed_positions
            .iter()
            .filter(|p| !p.is_open)
            .filter(|p| p.closed_at.is_some_and(|at| at >= start && at < end))
            .filter_map(|p| p.realized_pnl_usd)
            .filter(|pnl| *pnl < Decimal::ZERO)
            .map(|pnl| pnl.abs())
            .sum();

        self.modify(account, move |state, _| {
            if state.daily_loss_usd != derived {
                info!(
                    account = %state.account,
                    stored = %state.daily_loss_usd,
                    derived = %derived,
                    "Reconciled daily loss"
                );
            }
            state.daily_loss_usd = derived;
        })
        .await
    }

    /// Positions of `account`'s strategies closed during today's trading
    /// day.
    pub async fn closed_positions_today(&self, account: &str) -> RiskResult<Vec<Position>> {
        let strategy_ids: HashSet<String> = self
            .tables
            .strategies_for_account(account)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        if strategy_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (start, end) = day_bounds(trading_day(self.clock.now()));
        let mut positions = self.tables.closed_positions_between(start, end).await?;
        positions.retain(|p| strategy_ids.contains(&p.strategy_id));
        Ok(positions)
    }

    /// Re-derive `account`'s daily loss from its stored closed positions.
    pub async fn reconcile_account(&self, account: &str) -> RiskResult<RiskState> {
        let positions = self.closed_positions_today(account).await?;
        self.reconcile_daily_loss(account, &positions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::{
        ManualClock, OrderSide, Price, Size, Strategy, StrategyLimits, StrategyMode,
    };
    use atlas_store::MemoryStore;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-05T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn ledger() -> (Arc<ManualClock>, RiskLedger) {
        let clock = Arc::new(ManualClock::new(t0()));
        let tables = Tables::new(Arc::new(MemoryStore::new()));
        (clock.clone(), RiskLedger::new(tables, clock))
    }

    fn closed(pnl: Decimal, closed_at: DateTime<Utc>) -> Position {
        Position {
            id: atlas_core::order::new_row_id(),
            strategy_id: "s1".to_string(),
            symbol: "BTC".to_string(),
            side: OrderSide::Buy,
            qty: Size::new(dec!(1)),
            entry_price: Price::new(dec!(100)),
            stop_loss_price: None,
            take_profit_price: None,
            entry_order_id: "o1".to_string(),
            is_open: false,
            is_paper: true,
            opened_at: closed_at - Duration::minutes(5),
            closed_at: Some(closed_at),
            exit_price: None,
            realized_pnl_usd: Some(pnl),
        }
    }

    #[tokio::test]
    async fn test_lazy_row_creation() {
        let (_, ledger) = ledger();
        let state = ledger.current("acct").await.unwrap();
        assert_eq!(state.trading_day, trading_day(t0()));
        assert_eq!(state.daily_trade_count, 0);
        // Second read returns the same row.
        assert_eq!(ledger.current("acct").await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_record_trade_and_losses() {
        let (_, ledger) = ledger();
        ledger.record_trade("acct").await.unwrap();
        let state = ledger.record_trade("acct").await.unwrap();
        assert_eq!(state.daily_trade_count, 2);

        ledger.record_realized_pnl("acct", dec!(-120)).await.unwrap();
        let state = ledger.record_realized_pnl("acct", dec!(300)).await.unwrap();
        assert_eq!(state.daily_loss_usd, dec!(120));
        let state = ledger.record_realized_pnl("acct", dec!(-30.5)).await.unwrap();
        assert_eq!(state.daily_loss_usd, dec!(150.5));
    }

    #[tokio::test]
    async fn test_kill_switch_and_cooldown_carry_over() {
        let (clock, ledger) = ledger();
        ledger.activate_kill_switch("acct", "manual halt").await.unwrap();
        ledger
            .start_cooldown("acct", t0() + Duration::days(2))
            .await
            .unwrap();
        ledger.record_trade("acct").await.unwrap();

        clock.advance(Duration::days(1));
        let next = ledger.current("acct").await.unwrap();
        assert_eq!(next.trading_day, trading_day(t0()).succ_opt().unwrap());
        assert!(next.kill_switch_active);
        assert_eq!(next.kill_switch_reason.as_deref(), Some("manual halt"));
        assert_eq!(next.cooldown_until, Some(t0() + Duration::days(2)));
        assert_eq!(next.daily_trade_count, 0);

        let cleared = ledger.clear_kill_switch("acct").await.unwrap();
        assert!(!cleared.kill_switch_active);
        let cleared = ledger.clear_cooldown("acct").await.unwrap();
        assert_eq!(cleared.cooldown_until, None);
    }

    #[tokio::test]
    async fn test_expired_cooldown_not_carried() {
        let (clock, ledger) = ledger();
        ledger
            .start_cooldown("acct", t0() + Duration::minutes(15))
            .await
            .unwrap();
        clock.advance(Duration::days(1));
        assert_eq!(ledger.current("acct").await.unwrap().cooldown_until, None);
    }

    #[tokio::test]
    async fn test_cooldown_never_shortened() {
        let (_, ledger) = ledger();
        let long = t0() + Duration::minutes(30);
        ledger.start_cooldown("acct", long).await.unwrap();
        let state = ledger
            .start_cooldown("acct", t0() + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(state.cooldown_until, Some(long));
    }

    #[tokio::test]
    async fn test_reconcile_daily_loss() {
        let (_, ledger) = ledger();
        ledger.record_realized_pnl("acct", dec!(-999)).await.unwrap();

        let positions = vec![
            closed(dec!(-40), t0() - Duration::hours(1)),
            closed(dec!(25), t0() - Duration::hours(2)),
            closed(dec!(-10), t0() - Duration::minutes(1)),
            // Yesterday: ignored.
            closed(dec!(-500), t0() - Duration::days(1)),
        ];
        let state = ledger.reconcile_daily_loss("acct", &positions).await.unwrap();
        assert_eq!(state.daily_loss_usd, dec!(50));
    }

    #[tokio::test]
    async fn test_reconcile_account_counts_only_own_strategies() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tables = Tables::new(Arc::new(MemoryStore::new()));
        let ledger = RiskLedger::new(tables.clone(), clock);
        for (id, account) in [("s1", "acct"), ("s2", "other")] {
            let strategy = Strategy::new(id, account, "BTC", StrategyMode::Paper, StrategyLimits::default());
            tables.insert_strategy(&strategy).await.unwrap();
        }

        let own = closed(dec!(-40), t0() - Duration::hours(1));
        let mut foreign = closed(dec!(-300), t0() - Duration::hours(1));
        foreign.strategy_id = "s2".to_string();
        tables.insert_position(&own).await.unwrap();
        tables.insert_position(&foreign).await.unwrap();

        let today = ledger.closed_positions_today("acct").await.unwrap();
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].id, own.id);

        let state = ledger.reconcile_account("acct").await.unwrap();
        assert_eq!(state.daily_loss_usd, dec!(40));
        let state = ledger.reconcile_account("other").await.unwrap();
        assert_eq!(state.daily_loss_usd, dec!(300));
        assert!(ledger.closed_positions_today("nobody").await.unwrap().is_empty());
    }
}
