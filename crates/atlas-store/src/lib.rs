//! Durable store boundary for Atlas.
//!
//! - `store`: the `Store` trait, queries, preconditions and change streams
//! - `memory`: in-process `MemoryStore`
//! - `tables`: typed accessors per table
//! - `journal`: JSON Lines change journal

pub mod error;
pub mod journal;
pub mod memory;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use journal::{read_journal, JournalWriter};
pub use memory::MemoryStore;
pub use store::{
    BoxFuture, Change, ChangeKind, ChangeStream, Filter, Precondition, Query, SortOrder, Store,
    Table,
};
pub use tables::Tables;
