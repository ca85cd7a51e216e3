//! Routing store: the only state shared between handler invocations.
//!
//! # Layers
//!
//! - **[`KvStore`]**: a table-scoped key-value backend with prefix scans.
//!   Every call is a round trip to the backend; nothing is cached in
//!   process.
//! - **[`RoutingStore`]**: the connection registry (subscriptions, dual
//!   indexed by subject and by connection) and the pending-request
//!   registry, expressed as plain reads and writes on three tables.
//!
//! # Consistency
//!
//! Backends offer no multi-key transactions. A subscription is written as
//! two independent keys, so a crash or failure between the two writes
//! leaves a half-pair behind. [`RoutingStore::sweep`] finds and removes
//! those.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub mod dir;
pub mod memory;
pub mod registry;
pub mod sweep;

pub use dir::DirKv;
pub use memory::MemoryKv;
pub use registry::{ConnectionCleanup, RoutingStore};
pub use sweep::SweepReport;

/// The independently-named tables behind the routing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Forward subscription index, keyed `subject_connection`.
    SubscriptionsBySubject,
    /// Reverse subscription index, keyed `connection_subject`.
    SubscriptionsByConnection,
    /// Pending requests, keyed `connection_inbox`.
    PendingRequests,
}

impl Table {
    pub const ALL: [Table; 3] = [
        Table::SubscriptionsBySubject,
        Table::SubscriptionsByConnection,
        Table::PendingRequests,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::SubscriptionsBySubject => "subscriptions_by_subject",
            Table::SubscriptionsByConnection => "subscriptions_by_connection",
            Table::PendingRequests => "pending_requests",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {table}/{key}")]
    NotFound { table: Table, key: String },

    #[error("corrupt record {table}/{key}: {reason}")]
    Corrupt {
        table: Table,
        key: String,
        reason: String,
    },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Table-scoped key-value backend.
///
/// `delete` of an absent key succeeds. `scan_prefix` returns entries in
/// ascending key order; an empty prefix scans the whole table.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, table: Table, key: &str) -> StoreResult<Vec<u8>>;
    async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> StoreResult<()>;
    async fn delete(&self, table: Table, key: &str) -> StoreResult<()>;
    async fn scan_prefix(&self, table: Table, prefix: &str)
        -> StoreResult<Vec<(String, Vec<u8>)>>;
    fn backend_name(&self) -> &'static str;
}

/// Which [`KvStore`] implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Dir,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StoreBackend::Memory),
            "dir" => Ok(StoreBackend::Dir),
            other => Err(format!("unknown store backend: {other} (expected memory or dir)")),
        }
    }
}

/// Open the configured backend.
pub fn open(backend: StoreBackend, path: &Path) -> StoreResult<Arc<dyn KvStore>> {
    let kv: Arc<dyn KvStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryKv::new()),
        StoreBackend::Dir => Arc::new(DirKv::open(path)?),
    };
    info!(backend = kv.backend_name(), "routing store opened");
    Ok(kv)
}
