//! Durable store boundary.
//!
//! Rows are JSON objects keyed by their `id` column. The trait mirrors the
//! row-level operations the engine needs (read, insert, conditional update,
//! query, change notifications); typed access lives in `tables`.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::warn;

/// Boxed future type for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Primary key column of every table.
pub const KEY_COLUMN: &str = "id";

// ============================================================================
// Tables
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Strategies,
    Intents,
    Orders,
    Fills,
    Positions,
    RiskState,
    RiskEvents,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Strategies,
        Table::Intents,
        Table::Orders,
        Table::Fills,
        Table::Positions,
        Table::RiskState,
        Table::RiskEvents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strategies => "strategies",
            Self::Intents => "intents",
            Self::Orders => "orders",
            Self::Fills => "fills",
            Self::Positions => "positions",
            Self::RiskState => "risk_state",
            Self::RiskEvents => "risk_events",
        }
    }

    /// Columns that must be unique besides the key.
    pub fn unique_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Intents | Self::Orders => &["client_order_id"],
            _ => &[],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Column filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::Eq(column.to_string(), value.into())
    }

    pub fn gte(column: &str, value: impl Into<Value>) -> Self {
        Self::Gte(column.to_string(), value.into())
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        Self::Lt(column.to_string(), value.into())
    }

    pub fn matches(&self, row: &Value) -> bool {
        let (column, expected) = match self {
            Self::Eq(c, v) | Self::Gt(c, v) | Self::Gte(c, v) | Self::Lt(c, v) | Self::Lte(c, v) => {
                (c, v)
            }
        };
        let actual = row.get(column).unwrap_or(&Value::Null);
        if let Self::Eq(..) = self {
            return values_equal(actual, expected);
        }
        if actual.is_null() {
            return false;
        }
        match compare_values(actual, expected) {
            Some(ord) => match self {
                Self::Gt(..) => ord == Ordering::Greater,
                Self::Gte(..) => ord != Ordering::Less,
                Self::Lt(..) => ord == Ordering::Less,
                Self::Lte(..) => ord != Ordering::Greater,
                Self::Eq(..) => ord == Ordering::Equal,
            },
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Row query: conjunction of filters, optional ordering and limit.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: &str, order: SortOrder) -> Self {
        self.order_by = Some((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Filter, sort and truncate `rows`.
    pub fn apply<'a>(&self, rows: impl Iterator<Item = &'a Value>) -> Vec<Value> {
        let mut out: Vec<Value> = rows.filter(|r| self.matches(r)).cloned().collect();
        if let Some((column, order)) = &self.order_by {
            out.sort_by(|a, b| {
                let a = a.get(column).unwrap_or(&Value::Null);
                let b = b.get(column).unwrap_or(&Value::Null);
                let ord = compare_values(a, b).unwrap_or(Ordering::Equal);
                match order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Guard for a conditional update: `column` must currently equal `equals`.
#[derive(Debug, Clone, PartialEq)]
pub struct Precondition {
    pub column: String,
    pub equals: Value,
}

impl Precondition {
    pub fn new(column: &str, equals: impl Into<Value>) -> Self {
        Self {
            column: column.to_string(),
            equals: equals.into(),
        }
    }

    pub fn check(&self, row: &Value) -> StoreResult<()> {
        let actual = row.get(&self.column).cloned().unwrap_or(Value::Null);
        if values_equal(&actual, &self.equals) {
            Ok(())
        } else {
            Err(StoreError::PreconditionFailed {
                column: self.column.clone(),
                expected: self.equals.clone(),
                actual,
            })
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Some(Ordering::Equal)
}

/// Compare two column values.
///
/// Decimal strings compare numerically and RFC 3339 strings compare as
/// instants; other strings compare lexically. Mixed types are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => {
            if let (Ok(x), Ok(y)) = (Decimal::from_str(x), Decimal::from_str(y)) {
                return Some(x.cmp(&y));
            }
            if let (Ok(x), Ok(y)) = (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                return Some(x.cmp(&y));
            }
            Some(x.cmp(y))
        }
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => None,
    }
}

/// Shallow merge of `partial` into `row`.
pub fn merge_row(row: &mut Value, partial: &Map<String, Value>) {
    if let Value::Object(fields) = row {
        for (k, v) in partial {
            if k != KEY_COLUMN {
                fields.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Key of a row, if it has one.
pub fn row_key(row: &Value) -> Option<&str> {
    row.get(KEY_COLUMN).and_then(Value::as_str)
}

// ============================================================================
// Change notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One committed row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub table: Table,
    pub kind: ChangeKind,
    pub key: String,
    /// Row after the change; the removed row for deletes.
    pub row: Value,
    pub at: DateTime<Utc>,
}

/// Filtered stream of changes for one table.
pub struct ChangeStream {
    table: Table,
    filter: Option<Filter>,
    rx: broadcast::Receiver<Change>,
}

impl ChangeStream {
    pub fn new(table: Table, filter: Option<Filter>, rx: broadcast::Receiver<Change>) -> Self {
        Self { table, filter, rx }
    }

    fn accepts(&self, change: &Change) -> bool {
        change.table == self.table
            && self
                .filter
                .as_ref()
                .map(|f| f.matches(&change.row))
                .unwrap_or(true)
    }

    /// Next matching change; `None` once the store is dropped.
    pub async fn next(&mut self) -> Option<Change> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.accepts(&change) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(table = %self.table, skipped, "Change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching change without waiting.
    pub fn try_next(&mut self) -> Option<Change> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if self.accepts(&change) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(table = %self.table, skipped, "Change stream lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// Row-level durable store.
pub trait Store: Send + Sync {
    fn read_row<'a>(&'a self, table: Table, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Value>>>;

    /// Insert a row and return its key. A missing `id` is generated.
    fn insert_row(&self, table: Table, values: Value) -> BoxFuture<'_, StoreResult<String>>;

    /// Merge `partial` into the row at `key`, atomically checking
    /// `precondition` first. Returns the updated row.
    fn update_row<'a>(
        &'a self,
        table: Table,
        key: &'a str,
        partial: Value,
        precondition: Option<Precondition>,
    ) -> BoxFuture<'a, StoreResult<Value>>;

    fn delete_row<'a>(&'a self, table: Table, key: &'a str) -> BoxFuture<'a, StoreResult<bool>>;

    fn query_rows(&self, table: Table, query: Query) -> BoxFuture<'_, StoreResult<Vec<Value>>>;

    fn subscribe_changes(&self, table: Table, filter: Option<Filter>) -> ChangeStream;
}
