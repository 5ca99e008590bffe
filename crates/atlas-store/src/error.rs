//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Row not found: {table}/{key}")]
    NotFound { table: String, key: String },

    #[error("Duplicate row in {table}: {column} = {value}")]
    Duplicate {
        table: String,
        column: String,
        value: String,
    },

    #[error("Precondition failed on {column}: expected {expected}, found {actual}")]
    PreconditionFailed {
        column: String,
        expected: serde_json::Value,
        actual: serde_json::Value,
    },

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
