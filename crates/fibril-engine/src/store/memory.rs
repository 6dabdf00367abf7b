// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process checkpoint store.
//!
//! Backs tests and single-process deployments that do not need durability
//! across restarts. Transactions buffer their operations and apply them
//! atomically on commit, matching the visibility rules of the SQL backends.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{CheckpointStore, StoreTransaction, StoredFlow};
use crate::error::{EngineError, Result};
use crate::state::{Checkpoint, FlowRunId, FlowStatus};

#[derive(Debug, Clone)]
struct MemoryRow {
    checkpoint: Checkpoint,
    updated_at: DateTime<Utc>,
}

enum MemoryOp {
    Write {
        run_id: FlowRunId,
        checkpoint: Checkpoint,
    },
    Delete {
        run_id: FlowRunId,
    },
    UpdateStatus {
        run_id: FlowRunId,
        status: FlowStatus,
    },
}

/// Checkpoint store backed by a shared in-memory map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<HashMap<FlowRunId, MemoryRow>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Buffered transaction over a [`MemoryStore`].
pub struct MemoryTransaction {
    ops: Vec<MemoryOp>,
    rows: Arc<Mutex<HashMap<FlowRunId, MemoryRow>>>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let mut rows = self.rows.lock().await;
        for op in self.ops {
            match op {
                MemoryOp::Write { run_id, checkpoint } => {
                    rows.insert(
                        run_id,
                        MemoryRow {
                            checkpoint,
                            updated_at: Utc::now(),
                        },
                    );
                }
                MemoryOp::Delete { run_id } => {
                    rows.remove(&run_id);
                }
                MemoryOp::UpdateStatus { run_id, status } => {
                    let Some(row) = rows.get_mut(&run_id) else {
                        return Err(EngineError::FlowNotFound(run_id));
                    };
                    row.checkpoint.status = status;
                    row.updated_at = Utc::now();
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn buffered(tx: &mut dyn StoreTransaction) -> Result<&mut MemoryTransaction> {
    tx.as_any_mut()
        .downcast_mut::<MemoryTransaction>()
        .ok_or_else(|| {
            EngineError::contract("store", "transaction does not belong to the memory backend")
        })
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            ops: Vec::new(),
            rows: Arc::clone(&self.rows),
        }))
    }

    async fn write(
        &self,
        tx: &mut dyn StoreTransaction,
        run_id: FlowRunId,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        buffered(tx)?.ops.push(MemoryOp::Write {
            run_id,
            checkpoint: checkpoint.clone(),
        });
        Ok(())
    }

    async fn delete(&self, tx: &mut dyn StoreTransaction, run_id: FlowRunId) -> Result<()> {
        buffered(tx)?.ops.push(MemoryOp::Delete { run_id });
        Ok(())
    }

    async fn update_status(
        &self,
        tx: &mut dyn StoreTransaction,
        run_id: FlowRunId,
        status: FlowStatus,
    ) -> Result<()> {
        buffered(tx)?
            .ops
            .push(MemoryOp::UpdateStatus { run_id, status });
        Ok(())
    }

    async fn read(&self, run_id: FlowRunId) -> Result<Option<Checkpoint>> {
        let rows = self.rows.lock().await;
        Ok(rows.get(&run_id).map(|row| row.checkpoint.clone()))
    }

    async fn list_by_status(&self, status: FlowStatus) -> Result<Vec<StoredFlow>> {
        let rows = self.rows.lock().await;
        let mut flows: Vec<StoredFlow> = rows
            .iter()
            .filter(|(_, row)| row.checkpoint.status == status)
            .map(|(run_id, row)| StoredFlow {
                run_id: *run_id,
                flow_name: row.checkpoint.flow_name.clone(),
                status: row.checkpoint.status,
                progress_step: row.checkpoint.progress_step.clone(),
                updated_at: row.updated_at,
            })
            .collect();
        flows.sort_by_key(|f| f.run_id);
        Ok(flows)
    }

    async fn count_by_status(&self, status: FlowStatus) -> Result<i64> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|row| row.checkpoint.status == status)
            .count() as i64)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(name: &str) -> Checkpoint {
        Checkpoint::initial(name, false, "test")
    }

    #[tokio::test]
    async fn test_write_is_invisible_until_commit() {
        let store = MemoryStore::new();
        let run_id = FlowRunId::new();

        let mut tx = store.begin().await.unwrap();
        store
            .write(tx.as_mut(), run_id, &checkpoint("trade"))
            .await
            .unwrap();
        assert!(store.read(run_id).await.unwrap().is_none());

        tx.commit().await.unwrap();
        let stored = store.read(run_id).await.unwrap().unwrap();
        assert_eq!(stored.flow_name, "trade");
    }

    #[tokio::test]
    async fn test_rollback_discards_buffered_operations() {
        let store = MemoryStore::new();
        let run_id = FlowRunId::new();

        let mut tx = store.begin().await.unwrap();
        store
            .write(tx.as_mut(), run_id, &checkpoint("trade"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(store.read(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_status_update_apply_on_commit() {
        let store = MemoryStore::new();
        let kept = FlowRunId::new();
        let gone = FlowRunId::new();

        let mut tx = store.begin().await.unwrap();
        store
            .write(tx.as_mut(), kept, &checkpoint("trade"))
            .await
            .unwrap();
        store
            .write(tx.as_mut(), gone, &checkpoint("import"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        store
            .update_status(tx.as_mut(), kept, FlowStatus::Hospitalized)
            .await
            .unwrap();
        store.delete(tx.as_mut(), gone).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.read(gone).await.unwrap().is_none());
        let listed = store.list_by_status(FlowStatus::Hospitalized).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].run_id, kept);
        assert_eq!(
            store.count_by_status(FlowStatus::Runnable).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_status_update_for_missing_row_fails_at_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        store
            .update_status(tx.as_mut(), FlowRunId::new(), FlowStatus::Paused)
            .await
            .unwrap();
        assert!(tx.commit().await.is_err());
    }
}
