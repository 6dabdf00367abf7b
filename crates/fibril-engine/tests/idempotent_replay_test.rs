// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent execution: incremental checkpoints are elided, a retry
//! replays the whole idempotent region, and a non-idempotent flow entering
//! an idempotent sub-flow restarts at the forced boundary.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use fibril_engine::{
    CheckpointStore, Flow, FlowContext, FlowError, MemoryStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StageState {
    staged: bool,
    packed: bool,
}

/// An idempotent flow whose checkpoints are all elided. Fails transiently
/// on the first attempt, after pausing so the test can inspect the store.
struct StagedExport {
    log: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicU32>,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl Flow for StagedExport {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let mut state: StageState = ctx.restored_state()?.unwrap_or_default();

        if !state.staged {
            self.log.lock().unwrap().push("stage".into());
            state.staged = true;
            ctx.checkpoint(&state).await?;
        }
        if !state.packed {
            self.log.lock().unwrap().push("pack".into());
            state.packed = true;
            ctx.checkpoint(&state).await?;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 1 {
            self.reached.notify_one();
            self.release.notified().await;
            return Err(FlowError::TransientConnection("export target gone".into()));
        }
        Ok(b"done".to_vec())
    }
}

#[tokio::test]
async fn test_idempotent_flow_elides_checkpoints_and_replays_in_full() {
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicU32::new(0));
    let reached = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let factory_log = Arc::clone(&log);
    let factory_attempts = Arc::clone(&attempts);
    let factory_reached = Arc::clone(&reached);
    let factory_release = Arc::clone(&release);
    let runtime = runtime("exporter")
        .register("staged_export", true, move |_args| {
            Ok(Box::new(StagedExport {
                log: Arc::clone(&factory_log),
                attempts: Arc::clone(&factory_attempts),
                reached: Arc::clone(&factory_reached),
                release: Arc::clone(&factory_release),
            }) as Box<dyn Flow>)
        })
        .with_store(Arc::clone(&store) as Arc<dyn CheckpointStore>)
        .build()
        .await
        .unwrap();

    let run_id = runtime.start_flow("staged_export", Vec::new()).await.unwrap();
    reached.notified().await;

    // Both checkpoints were elided: the stored row is still the initial one.
    let row = store.read(run_id).await.unwrap().unwrap();
    assert_eq!(row.suspend_ordinal, 0);
    assert!(row.continuation.is_empty());

    release.notify_one();
    let result = runtime.result(run_id).await.unwrap();
    assert_eq!(result, b"done");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // The retry replayed the whole region, not just the tail.
    assert_eq!(
        *log.lock().unwrap(),
        vec!["stage", "pack", "stage", "pack"]
    );

    runtime.shutdown().await;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PipelineState {
    prepared: bool,
    refined: bool,
}

/// Idempotent inner step. Its checkpoint is elided; a transient fault on
/// the first attempt restarts it at the boundary.
struct RefineStep {
    log: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Flow for RefineStep {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let mut state: PipelineState = ctx.restored_state()?.unwrap_or_default();
        if !state.refined {
            self.log.lock().unwrap().push("refine".into());
            state.refined = true;
            ctx.checkpoint(&state).await?;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 1 {
            return Err(FlowError::TransientConnection("refinery offline".into()));
        }
        Ok(b"refined".to_vec())
    }
}

/// Non-idempotent root that checkpoints its preparation, then enters the
/// idempotent refine step.
struct PipelineFlow {
    log: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Flow for PipelineFlow {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let mut state: PipelineState = ctx.restored_state()?.unwrap_or_default();
        if !state.prepared {
            self.log.lock().unwrap().push("prepare".into());
            state.prepared = true;
            ctx.checkpoint(&state).await?;
        }
        let inner = RefineStep {
            log: Arc::clone(&self.log),
            attempts: Arc::clone(&self.attempts),
        };
        ctx.sub_flow("refine", true, false, &inner).await
    }
}

#[tokio::test]
async fn test_retry_restarts_at_the_idempotent_boundary() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicU32::new(0));

    let factory_log = Arc::clone(&log);
    let factory_attempts = Arc::clone(&attempts);
    let runtime = runtime("refinery")
        .register("pipeline", false, move |_args| {
            Ok(Box::new(PipelineFlow {
                log: Arc::clone(&factory_log),
                attempts: Arc::clone(&factory_attempts),
            }) as Box<dyn Flow>)
        })
        .build()
        .await
        .unwrap();

    let run_id = runtime.start_flow("pipeline", Vec::new()).await.unwrap();
    let result = runtime.result(run_id).await.unwrap();
    assert_eq!(result, b"refined");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // Preparation ran once; only the idempotent step was replayed.
    assert_eq!(*log.lock().unwrap(), vec!["prepare", "refine", "refine"]);

    runtime.shutdown().await;
}
