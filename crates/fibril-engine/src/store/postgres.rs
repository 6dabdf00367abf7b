// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed checkpoint store.
//!
//! Multi-node deployment backend. Run ids are stored as native UUIDs and the
//! checkpoint payload as a JSON blob in a BYTEA column.

use std::any::Any;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use uuid::Uuid;

use super::{CheckpointStore, StoreTransaction, StoredFlow};
use crate::error::{EngineError, Result};
use crate::state::{Checkpoint, FlowRunId, FlowStatus};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// PostgreSQL-backed checkpoint store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to a PostgreSQL database URL and run embedded migrations.
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        info!("postgres checkpoint store ready");
        Ok(Self { pool })
    }

    /// Build a store from an existing pool. Migrations are still applied.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }
}

/// A live PostgreSQL transaction.
pub struct PostgresStoreTransaction {
    inner: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresStoreTransaction {
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

fn tx_mut(
    tx: &mut dyn StoreTransaction,
) -> Result<&mut sqlx::Transaction<'static, sqlx::Postgres>> {
    match tx.as_any_mut().downcast_mut::<PostgresStoreTransaction>() {
        Some(t) => Ok(&mut t.inner),
        None => Err(EngineError::contract(
            "store",
            "transaction does not belong to the postgres backend",
        )),
    }
}

#[derive(sqlx::FromRow)]
struct FlowRow {
    run_id: Uuid,
    flow_name: String,
    status: String,
    progress_step: Option<String>,
    updated_at: DateTime<Utc>,
}

impl FlowRow {
    fn into_stored(self) -> Result<StoredFlow> {
        let status = FlowStatus::from_str(&self.status)
            .map_err(|e| EngineError::contract("store", format!("bad status in row: {}", e)))?;
        Ok(StoredFlow {
            run_id: FlowRunId::from(self.run_id),
            flow_name: self.flow_name,
            status,
            progress_step: self.progress_step,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl CheckpointStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let inner = self.pool.begin().await?;
        Ok(Box::new(PostgresStoreTransaction { inner }))
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
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (run_id) DO UPDATE SET
                flow_name = EXCLUDED.flow_name,
                status = EXCLUDED.status,
                checkpoint = EXCLUDED.checkpoint,
                progress_step = EXCLUDED.progress_step,
                updated_at = NOW()
            "#,
        )
        .bind(run_id.as_uuid())
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
        sqlx::query("DELETE FROM flow_checkpoints WHERE run_id = $1")
            .bind(run_id.as_uuid())
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
            SET status = $2, updated_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id.as_uuid())
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
            sqlx::query_as("SELECT checkpoint FROM flow_checkpoints WHERE run_id = $1")
                .bind(run_id.as_uuid())
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
            WHERE status = $1
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
            sqlx::query_as("SELECT COUNT(*) FROM flow_checkpoints WHERE status = $1")
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
