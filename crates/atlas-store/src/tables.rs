//! Typed table accessors.
//!
//! Every table has a row struct in `atlas-core`; these accessors are the
//! only place rows are converted to and from JSON.

use crate::error::{StoreError, StoreResult};
use crate::store::{Filter, Precondition, Query, SortOrder, Store, Table, KEY_COLUMN};
use atlas_core::{
    ClientOrderId, Fill, Intent, IntentStatus, Order, OrderStatus, Position, RiskEvent, RiskState,
    Strategy, StrategyState,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

fn to_row<T: Serialize>(value: &T) -> StoreResult<Value> {
    let row = serde_json::to_value(value)?;
    if !row.is_object() {
        return Err(StoreError::InvalidRow("row must serialize to an object".to_string()));
    }
    Ok(row)
}

fn from_row<T: DeserializeOwned>(table: Table, row: Value) -> StoreResult<T> {
    serde_json::from_value(row)
        .map_err(|e| StoreError::InvalidRow(format!("undecodable {table} row: {e}")))
}

fn from_rows<T: DeserializeOwned>(table: Table, rows: Vec<Value>) -> StoreResult<Vec<T>> {
    rows.into_iter().map(|r| from_row(table, r)).collect()
}

/// Typed view over a `Store`.
#[derive(Clone)]
pub struct Tables {
    store: Arc<dyn Store>,
}

impl Tables {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StoreResult<Option<T>> {
        match self.store.read_row(table, key).await? {
            Some(row) => Ok(Some(from_row(table, row)?)),
            None => Ok(None),
        }
    }

    async fn require<T: DeserializeOwned>(&self, table: Table, key: &str) -> StoreResult<T> {
        self.get(table, key).await?.ok_or_else(|| StoreError::NotFound {
            table: table.to_string(),
            key: key.to_string(),
        })
    }

    async fn put_new<T: Serialize>(&self, table: Table, value: &T) -> StoreResult<String> {
        self.store.insert_row(table, to_row(value)?).await
    }

    async fn overwrite<T: Serialize + DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
        value: &T,
        precondition: Option<Precondition>,
    ) -> StoreResult<T> {
        let row = self
            .store
            .update_row(table, key, to_row(value)?, precondition)
            .await?;
        from_row(table, row)
    }

    async fn query<T: DeserializeOwned>(&self, table: Table, query: Query) -> StoreResult<Vec<T>> {
        let rows = self.store.query_rows(table, query).await?;
        from_rows(table, rows)
    }

    // ------------------------------------------------------------------
    // strategies
    // ------------------------------------------------------------------

    pub async fn insert_strategy(&self, strategy: &Strategy) -> StoreResult<String> {
        self.put_new(Table::Strategies, strategy).await
    }

    pub async fn get_strategy(&self, id: &str) -> StoreResult<Option<Strategy>> {
        self.get(Table::Strategies, id).await
    }

    pub async fn require_strategy(&self, id: &str) -> StoreResult<Strategy> {
        self.require(Table::Strategies, id).await
    }

    pub async fn strategies_for_account(&self, account: &str) -> StoreResult<Vec<Strategy>> {
        self.query(
            Table::Strategies,
            Query::new().filter(Filter::eq("account", account)),
        )
        .await
    }

    /// Overwrite the configured columns of an existing strategy. The
    /// lifecycle state is left alone.
    pub async fn update_strategy_config(&self, strategy: &Strategy) -> StoreResult<Strategy> {
        let partial = json!({
            "account": strategy.account,
            "symbol": strategy.symbol,
            "mode": strategy.mode,
            "limits": strategy.limits,
            "config_version": strategy.config_version,
        });
        let row = self
            .store
            .update_row(Table::Strategies, &strategy.id, partial, None)
            .await?;
        from_row(Table::Strategies, row)
    }

    /// Conditional state write: succeeds only while the stored state is
    /// still `expected`.
    pub async fn compare_and_set_state(
        &self,
        id: &str,
        expected: StrategyState,
        next: StrategyState,
        at: DateTime<Utc>,
        metadata: Value,
    ) -> StoreResult<Strategy> {
        let partial = json!({
            "current_state": next,
            "state_updated_at": at,
            "state_metadata": metadata,
        });
        let row = self
            .store
            .update_row(
                Table::Strategies,
                id,
                partial,
                Some(Precondition::new("current_state", serde_json::to_value(expected)?)),
            )
            .await?;
        from_row(Table::Strategies, row)
    }

    // ------------------------------------------------------------------
    // intents
    // ------------------------------------------------------------------

    pub async fn insert_intent(&self, intent: &Intent) -> StoreResult<String> {
        self.put_new(Table::Intents, intent).await
    }

    pub async fn get_intent(&self, id: &str) -> StoreResult<Option<Intent>> {
        self.get(Table::Intents, id).await
    }

    pub async fn set_intent_status(&self, id: &str, status: IntentStatus) -> StoreResult<()> {
        self.store
            .update_row(Table::Intents, id, json!({ "status": status }), None)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // orders
    // ------------------------------------------------------------------

    pub async fn find_order_by_client_id(
        &self,
        client_order_id: &ClientOrderId,
    ) -> StoreResult<Option<Order>> {
        let mut orders: Vec<Order> = self
            .query(
                Table::Orders,
                Query::new()
                    .filter(Filter::eq("client_order_id", client_order_id.as_str()))
                    .limit(1),
            )
            .await?;
        Ok(orders.pop())
    }

    pub async fn insert_order(&self, order: &Order) -> StoreResult<String> {
        self.put_new(Table::Orders, order).await
    }

    pub async fn get_order(&self, id: &str) -> StoreResult<Option<Order>> {
        self.get(Table::Orders, id).await
    }

    /// Write the full order row.
    pub async fn update_order(&self, order: &Order) -> StoreResult<Order> {
        self.overwrite(Table::Orders, &order.id, order, None).await
    }

    pub async fn orders_for_intent(&self, intent_id: &str) -> StoreResult<Vec<Order>> {
        self.query(
            Table::Orders,
            Query::new().filter(Filter::eq("intent_id", intent_id)),
        )
        .await
    }

    /// Orders in `status`, oldest first.
    pub async fn orders_with_status(&self, status: OrderStatus) -> StoreResult<Vec<Order>> {
        self.query(
            Table::Orders,
            Query::new()
                .filter(Filter::eq("status", status.as_str()))
                .order_by("created_at", SortOrder::Asc),
        )
        .await
    }

    // ------------------------------------------------------------------
    // fills
    // ------------------------------------------------------------------

    pub async fn insert_fill(&self, fill: &Fill) -> StoreResult<String> {
        self.put_new(Table::Fills, fill).await
    }

    pub async fn fills_for_order(&self, order_id: &str) -> StoreResult<Vec<Fill>> {
        self.query(
            Table::Fills,
            Query::new()
                .filter(Filter::eq("order_id", order_id))
                .order_by("filled_at", SortOrder::Asc),
        )
        .await
    }

    // ------------------------------------------------------------------
    // positions
    // ------------------------------------------------------------------

    pub async fn insert_position(&self, position: &Position) -> StoreResult<String> {
        self.put_new(Table::Positions, position).await
    }

    pub async fn get_position(&self, id: &str) -> StoreResult<Option<Position>> {
        self.get(Table::Positions, id).await
    }

    pub async fn require_position(&self, id: &str) -> StoreResult<Position> {
        self.require(Table::Positions, id).await
    }

    pub async fn position_for_order(&self, entry_order_id: &str) -> StoreResult<Option<Position>> {
        let mut positions: Vec<Position> = self
            .query(
                Table::Positions,
                Query::new()
                    .filter(Filter::eq("entry_order_id", entry_order_id))
                    .limit(1),
            )
            .await?;
        Ok(positions.pop())
    }

    /// Persist a closed position. Fails with `PreconditionFailed` when the
    /// stored row is already closed, so a position closes exactly once.
    pub async fn close_position(&self, position: &Position) -> StoreResult<Position> {
        self.overwrite(
            Table::Positions,
            &position.id,
            position,
            Some(Precondition::new("is_open", true)),
        )
        .await
    }

    pub async fn open_positions(&self, strategy_id: Option<&str>) -> StoreResult<Vec<Position>> {
        let mut query = Query::new()
            .filter(Filter::eq("is_open", true))
            .order_by("opened_at", SortOrder::Asc);
        if let Some(id) = strategy_id {
            query = query.filter(Filter::eq("strategy_id", id));
        }
        self.query(Table::Positions, query).await
    }

    /// Positions closed in `[from, to)`.
    pub async fn closed_positions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Position>> {
        self.query(
            Table::Positions,
            Query::new()
                .filter(Filter::eq("is_open", false))
                .filter(Filter::gte("closed_at", serde_json::to_value(from)?))
                .filter(Filter::lt("closed_at", serde_json::to_value(to)?))
                .order_by("closed_at", SortOrder::Asc),
        )
        .await
    }

    // ------------------------------------------------------------------
    // risk state
    // ------------------------------------------------------------------

    pub async fn get_risk_state(&self, key: &str) -> StoreResult<Option<RiskState>> {
        self.get(Table::RiskState, key).await
    }

    /// Latest risk row of `account` strictly before `key`'s day.
    pub async fn latest_risk_state_before(
        &self,
        account: &str,
        trading_day: chrono::NaiveDate,
    ) -> StoreResult<Option<RiskState>> {
        let mut rows: Vec<RiskState> = self
            .query(
                Table::RiskState,
                Query::new()
                    .filter(Filter::eq("account", account))
                    .filter(Filter::lt("trading_day", trading_day.to_string()))
                    .order_by("trading_day", SortOrder::Desc)
                    .limit(1),
            )
            .await?;
        Ok(rows.pop())
    }

    /// Insert the row for a new day.
    pub async fn insert_risk_state(&self, state: &RiskState) -> StoreResult<String> {
        let mut row = to_row(state)?;
        if let Value::Object(fields) = &mut row {
            fields.insert(KEY_COLUMN.to_string(), Value::String(state.row_key()));
        }
        self.store.insert_row(Table::RiskState, row).await
    }

    pub async fn update_risk_state(&self, state: &RiskState) -> StoreResult<RiskState> {
        self.overwrite(Table::RiskState, &state.row_key(), state, None)
            .await
    }

    // ------------------------------------------------------------------
    // risk events
    // ------------------------------------------------------------------

    pub async fn insert_risk_event(&self, event: &RiskEvent) -> StoreResult<String> {
        self.put_new(Table::RiskEvents, event).await
    }

    pub async fn recent_risk_events(&self, account: &str, limit: usize) -> StoreResult<Vec<RiskEvent>> {
        self.query(
            Table::RiskEvents,
            Query::new()
                .filter(Filter::eq("account", account))
                .order_by("created_at", SortOrder::Desc)
                .limit(limit),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use atlas_core::{OrderSide, OrderStatus, Price, RiskCode, StrategyLimits, StrategyMode};
    use chrono::{Duration, NaiveDate};
    use rust_decimal_macros::dec;

    fn tables() -> Tables {
        Tables::new(Arc::new(MemoryStore::new()))
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-05T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn strategy() -> Strategy {
        Strategy::new("s1", "acct", "BTC", StrategyMode::Paper, StrategyLimits::default())
    }

    fn position(id: &str, open: bool, closed_at: Option<DateTime<Utc>>) -> Position {
        Position {
            id: id.to_string(),
            strategy_id: "s1".to_string(),
            symbol: "BTC".to_string(),
            side: OrderSide::Buy,
            qty: atlas_core::Size::new(dec!(1)),
            entry_price: Price::new(dec!(100)),
            stop_loss_price: None,
            take_profit_price: None,
            entry_order_id: format!("order-{id}"),
            is_open: open,
            is_paper: true,
            opened_at: t0() - Duration::hours(1),
            closed_at,
            exit_price: None,
            realized_pnl_usd: None,
        }
    }

    #[tokio::test]
    async fn test_strategy_round_trip_and_cas() {
        let tables = tables();
        tables.insert_strategy(&strategy()).await.unwrap();

        let updated = tables
            .compare_and_set_state(
                "s1",
                StrategyState::Idle,
                StrategyState::Setup,
                t0(),
                json!({"reason": "signal"}),
            )
            .await
            .unwrap();
        assert_eq!(updated.current_state, StrategyState::Setup);
        assert_eq!(updated.state_metadata["reason"], "signal");

        let err = tables
            .compare_and_set_state("s1", StrategyState::Idle, StrategyState::Setup, t0(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_config_update_keeps_state() {
        let tables = tables();
        tables.insert_strategy(&strategy()).await.unwrap();
        tables
            .compare_and_set_state("s1", StrategyState::Idle, StrategyState::Setup, t0(), Value::Null)
            .await
            .unwrap();

        let mut changed = strategy();
        changed.mode = StrategyMode::Live;
        changed.limits.cooldown_minutes = 45;
        let stored = tables.update_strategy_config(&changed).await.unwrap();
        assert_eq!(stored.mode, StrategyMode::Live);
        assert_eq!(stored.limits.cooldown_minutes, 45);
        assert_eq!(stored.current_state, StrategyState::Setup);
    }

    #[tokio::test]
    async fn test_order_lookup_by_client_id() {
        let tables = tables();
        let intent = Intent::new("s1", "btc", OrderSide::Buy, dec!(100)).with_intended_price(Price::new(dec!(50)));
        let mut order = Order::pending(&intent, t0());
        tables.insert_order(&order).await.unwrap();

        let found = tables
            .find_order_by_client_id(&intent.client_order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, order);

        order.status = OrderStatus::Filled;
        order.apply_fill(atlas_core::Size::new(dec!(2)), dec!(100));
        let stored = tables.update_order(&order).await.unwrap();
        assert_eq!(stored.filled_avg_price, Some(Price::new(dec!(50))));
        assert_eq!(tables.orders_with_status(OrderStatus::Filled).await.unwrap().len(), 1);
        assert!(tables
            .orders_with_status(OrderStatus::Pending)
            .await
            .unwrap()
            .is_empty());

        // Same client order id cannot be inserted twice.
        let dup = Order::pending(&intent, t0());
        assert!(matches!(
            tables.insert_order(&dup).await.unwrap_err(),
            StoreError::Duplicate { .. }
        ));
    }

    #[tokio::test]
    async fn test_position_closes_once() {
        let tables = tables();
        let mut pos = position("p1", true, None);
        tables.insert_position(&pos).await.unwrap();

        pos.close(Price::new(dec!(90)), t0()).unwrap();
        let closed = tables.close_position(&pos).await.unwrap();
        assert!(!closed.is_open);
        assert_eq!(closed.realized_pnl_usd, Some(dec!(-10)));

        assert!(tables.close_position(&pos).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_positions_between() {
        let tables = tables();
        tables
            .insert_position(&position("a", false, Some(t0())))
            .await
            .unwrap();
        tables
            .insert_position(&position("b", false, Some(t0() - Duration::days(1))))
            .await
            .unwrap();
        tables.insert_position(&position("c", true, None)).await.unwrap();

        let day_start = t0() - Duration::hours(12);
        let closed = tables
            .closed_positions_between(day_start, day_start + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, "a");

        let open = tables.open_positions(Some("s1")).await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_risk_state_rows_keyed_by_account_day() {
        let tables = tables();
        let day = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let mut state = RiskState::fresh("acct", day, t0());
        let key = tables.insert_risk_state(&state).await.unwrap();
        assert_eq!(key, "acct:2026-01-05");

        state.daily_trade_count = 3;
        tables.update_risk_state(&state).await.unwrap();
        let read = tables.get_risk_state(&key).await.unwrap().unwrap();
        assert_eq!(read.daily_trade_count, 3);

        let next_day = day.succ_opt().unwrap();
        let prev = tables
            .latest_risk_state_before("acct", next_day)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prev.trading_day, day);
        assert!(tables
            .latest_risk_state_before("acct", day)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_recent_risk_events_newest_first() {
        let tables = tables();
        for i in 0..3 {
            let event = RiskEvent::new(
                "acct",
                RiskCode::MaxTradesExceeded,
                format!("event {i}"),
                t0() + Duration::minutes(i),
            );
            tables.insert_risk_event(&event).await.unwrap();
        }
        let events = tables.recent_risk_events("acct", 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "event 2");
    }
}
