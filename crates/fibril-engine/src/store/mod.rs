//! Checkpoint storage interfaces and backends.
//!
//! Checkpoint writes, deletes, and status updates run inside an explicit
//! [`StoreTransaction`] so a transition's persistence effects commit or roll
//! back as one unit. Reads run outside any transaction; the engine only reads
//! committed state.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::state::{Checkpoint, FlowRunId, FlowStatus};

/// Summary row describing a stored flow run, for operator queries.
#[derive(Debug, Clone)]
pub struct StoredFlow {
    /// The run this row belongs to.
    pub run_id: FlowRunId,
    /// Registered name of the flow.
    pub flow_name: String,
    /// Status column value.
    pub status: FlowStatus,
    /// Last progress step reported by the flow.
    pub progress_step: Option<String>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

/// An open storage transaction.
///
/// Obtained from [`CheckpointStore::begin`] and consumed by exactly one of
/// `commit` or `rollback`. Mutating store operations take the transaction as
/// a parameter; handing one to a different backend than the one that opened
/// it is a contract violation.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Make every operation performed under this transaction durable.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every operation performed under this transaction.
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Downcast hook for backends to recover their concrete transaction.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Durable checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Open a transaction for a single event-processing step.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Insert or replace the checkpoint row for `run_id`.
    async fn write(
        &self,
        tx: &mut dyn StoreTransaction,
        run_id: FlowRunId,
        checkpoint: &Checkpoint,
    ) -> Result<()>;

    /// Delete the checkpoint row for `run_id`. Deleting an absent row is not
    /// an error.
    async fn delete(&self, tx: &mut dyn StoreTransaction, run_id: FlowRunId) -> Result<()>;

    /// Update only the status column for `run_id`.
    async fn update_status(
        &self,
        tx: &mut dyn StoreTransaction,
        run_id: FlowRunId,
        status: FlowStatus,
    ) -> Result<()>;

    /// Read the committed checkpoint for `run_id`.
    async fn read(&self, run_id: FlowRunId) -> Result<Option<Checkpoint>>;

    /// List stored flows with the given status.
    async fn list_by_status(&self, status: FlowStatus) -> Result<Vec<StoredFlow>>;

    /// Count stored flows with the given status.
    async fn count_by_status(&self, status: FlowStatus) -> Result<i64>;

    /// Verify the backend is reachable.
    async fn health_check(&self) -> Result<bool>;
}

/// Build a store from a database URL.
///
/// `memory` selects the in-process store; `sqlite:` and `postgres:`/
/// `postgresql:` URLs select the corresponding pooled backend and run its
/// embedded migrations.
pub async fn create_store(database_url: &str) -> Result<Arc<dyn CheckpointStore>> {
    if database_url == "memory" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if database_url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteStore::from_url(database_url).await?));
    }
    if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
        return Ok(Arc::new(PostgresStore::from_url(database_url).await?));
    }
    Err(EngineError::Config {
        var: "database_url".to_string(),
        reason: format!(
            "unsupported database url '{}'; expected 'memory', 'sqlite:...' or 'postgres:...'",
            database_url
        ),
    })
}
