//! Crash-safe staging store for a store-and-forward proxy
//!
//! Received sources are split into items and entries, items are grouped
//! into bounded aggregates, and aggregates (or whole sources in direct mode)
//! are tracked per destination until every destination has accepted them.
//! All state lives in one SQLite file; every queue is a column of a table,
//! so a restart resumes exactly where the previous process stopped.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod dest;
pub mod error;
pub mod forward;
pub mod ids;
pub mod model;
pub mod queue;
pub mod repo;
pub mod source;

pub use aggregate::{AggregateBounds, AggregateStore};
pub use config::{AggregationConfig, DbConfig, ForwardingConfig, RepoConfig};
pub use db::{Database, MaintenanceTask};
pub use dest::ForwardDestStore;
pub use error::{RepoError, RepoResult};
pub use forward::{
    ForwardAggregateStore, ForwardSourceStore, ForwardStore, ForwardSubject, UpdateOutcome,
};
pub use model::{
    AddSource, Aggregate, EntryKind, ForwardDest, ForwardItem, ForwardRecord, NewEntry, NewItem,
    NewItemRef, RepoSource, SourceEntry, SourceItem,
};
pub use queue::PositionQueue;
pub use repo::{HousekeepingReport, ProxyRepo, RepoStats};
pub use source::SourceStore;

/// Wall clock in epoch milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
