// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed checkpoint store.
//!
//! Single-file deployment backend. Run ids are stored as TEXT and the
//! checkpoint payload as a JSON blob.

use std::any::Any;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use super::{CheckpointStore, StoreTransaction, StoredFlow};
use crate::error::{EngineError, Result};
use crate::state::{Checkpoint, FlowRunId, FlowStatus};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed checkpoint store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a SQLite database URL and run embedded migrations.
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        info!(url = %url, "sqlite checkpoint store ready");
        Ok(Self { pool })
    }

    /// Connect to a SQLite database file, creating it if missing.
    pub async fn from_path(path: &str) -> Result<Self> {
        Self::from_url(&format!("sqlite:{}?mode=rwc", path)).await
    }

    /// Build a store from an existing pool. Migrations are still applied.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }
}

/// A live SQLite transaction.
pub struct SqliteStoreTransaction {
    inner: sqlx::Transaction<'static, sqlx::Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteStoreTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn tx_mut(tx: &mut dyn StoreTransaction) -> Result<&mut sqlx::Transaction<'static, sqlx::Sqlite>> {
    match tx.as_any_mut().downcast_mut::<SqliteStoreTransaction>() {
        Some(t) => Ok(&mut t.inner),
        None => Err(EngineError::contract(
            "store",
            "transaction does not belong to the sqlite backend",
        )),
    }
}

#[derive(sqlx::FromRow)]
struct FlowRow {
    run_id: String,
    flow_name: String,
    status: String,
    progress_step: Option<String>,
    updated_at: DateTime<Utc>,
}

impl FlowRow {
    fn into_stored(self) -> Result<StoredFlow> {
        let run_id = FlowRunId::from_str(&self.run_id)
            .map_err(|e| EngineError::contract("store", format!("bad run id in row: {}", e)))?;
        let status = FlowStatus::from_str(&self.status)
            .map_err(|e| EngineError::contract("store", format!("bad status in row: {}", e)))?;
        Ok(StoredFlow {
            run_id,
            flow_name: self.flow_name,
            status,
            progress_step: self.progress_step,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let inner = self.pool.begin().await?;
        Ok(Box::new(SqliteStoreTransaction { inner }))
    }

    async fn write(
        &self,
        tx: &mut dyn StoreTransaction,
        run_id: FlowRunId,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        let tx = tx_mut(tx)?;
        let bytes = serde_json::to_vec(checkpoint)?;
        sqlx::query(
            r#"
            INSERT INTO flow_checkpoints (run_id, flow_name, status, checkpoint, progress_step, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
            ON CONFLICT(run_id) DO UPDATE SET
                flow_name = excluded.flow_name,
                status = excluded.status,
                checkpoint = excluded.checkpoint,
                progress_step = excluded.progress_step,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(run_id.to_string())
        .bind(&checkpoint.flow_name)
        .bind(checkpoint.status.as_str())
        .bind(&bytes)
        .bind(&checkpoint.progress_step)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete(&self, tx: &mut dyn StoreTransaction, run_id: FlowRunId) -> Result<()> {
        let tx = tx_mut(tx)?;
        sqlx::query("DELETE FROM flow_checkpoints WHERE run_id = ?1")
            .bind(run_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        tx: &mut dyn StoreTransaction,
        run_id: FlowRunId,
        status: FlowStatus,
    ) -> Result<()> {
        let tx = tx_mut(tx)?;
        let result = sqlx::query(
            r#"
            UPDATE flow_checkpoints
            SET status = ?2, updated_at = CURRENT_TIMESTAMP
            WHERE run_id = ?1
            "#,
        )
        .bind(run_id.to_string())
        .bind(status.as_str())
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::FlowNotFound(run_id));
        }
        Ok(())
    }

    async fn read(&self, run_id: FlowRunId) -> Result<Option<Checkpoint>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT checkpoint FROM flow_checkpoints WHERE run_id = ?1")
                .bind(run_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((bytes,)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_by_status(&self, status: FlowStatus) -> Result<Vec<StoredFlow>> {
        let rows = sqlx::query_as::<_, FlowRow>(
            r#"
            SELECT run_id, flow_name, status, progress_step, updated_at
            FROM flow_checkpoints
            WHERE status = ?1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FlowRow::into_stored).collect()
    }

    async fn count_by_status(&self, status: FlowStatus) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM flow_checkpoints WHERE status = ?1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
