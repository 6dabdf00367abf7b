// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end triage: transient retries, the retry ceiling, terminal
//! business faults, and operator revival of quarantined runs.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::*;
use fibril_engine::{
    Diagnosis, EngineError, Flow, FlowContext, FlowError, FlowRuntime, FlowStatus,
};

/// Fails with a transient fault for the first `failures` attempts, then
/// succeeds. The fault is wrapped `wrap_layers` deep to exercise cause-chain
/// triage.
struct FlakyFlow {
    attempts: Arc<AtomicU32>,
    failures: u32,
    wrap_layers: u32,
}

#[async_trait::async_trait]
impl Flow for FlakyFlow {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        ctx.progress("uploading").await?;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            let mut error = FlowError::TransientConnection("socket reset".into());
            for layer in 0..self.wrap_layers {
                error = error.wrap(format!("layer {}", layer));
            }
            return Err(error);
        }
        Ok(b"uploaded".to_vec())
    }
}

async fn flaky_runtime(
    failures: u32,
    wrap_layers: u32,
    attempts: Arc<AtomicU32>,
) -> FlowRuntime {
    runtime("uploader")
        .register("flaky", false, move |_args| {
            Ok(Box::new(FlakyFlow {
                attempts: Arc::clone(&attempts),
                failures,
                wrap_layers,
            }) as Box<dyn Flow>)
        })
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_transient_fault_retries_until_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let runtime = flaky_runtime(2, 0, Arc::clone(&attempts)).await;

    let run_id = runtime.start_flow("flaky", Vec::new()).await.unwrap();
    let result = runtime.result(run_id).await.unwrap();

    assert_eq!(result, b"uploaded");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let records = runtime.medical_history(run_id).await;
    assert_eq!(records.len(), 2);
    let backoffs: Vec<_> = records
        .iter()
        .map(|record| match record.outcome {
            Diagnosis::Retry { backoff } => backoff,
            ref other => panic!("expected a retry diagnosis, got {:?}", other),
        })
        .collect();
    assert_eq!(backoffs[1], backoffs[0] * 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_retry_ceiling_quarantines_the_run() {
    let attempts = Arc::new(AtomicU32::new(0));
    let runtime = flaky_runtime(100, 0, Arc::clone(&attempts)).await;

    let run_id = runtime.start_flow("flaky", Vec::new()).await.unwrap();
    wait_for_status(&runtime, run_id, FlowStatus::Hospitalized).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let records = runtime.medical_history(run_id).await;
    assert_eq!(records.len(), 4);
    for record in &records[..3] {
        assert!(matches!(record.outcome, Diagnosis::Retry { .. }));
    }
    assert!(matches!(records[3].outcome, Diagnosis::Quarantine));

    assert_eq!(runtime.count_hospitalized().await.unwrap(), 1);
    let listed = runtime
        .list_by_status(FlowStatus::Hospitalized)
        .await
        .unwrap();
    assert!(listed.iter().any(|row| row.run_id == run_id));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_wrapped_transient_fault_is_recognized() {
    let attempts = Arc::new(AtomicU32::new(0));
    let runtime = flaky_runtime(1, 2, Arc::clone(&attempts)).await;

    let run_id = runtime.start_flow("flaky", Vec::new()).await.unwrap();
    let result = runtime.result(run_id).await.unwrap();

    assert_eq!(result, b"uploaded");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let records = runtime.medical_history(run_id).await;
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].outcome, Diagnosis::Retry { .. }));

    runtime.shutdown().await;
}

struct RejectedFlow;

#[async_trait::async_trait]
impl Flow for RejectedFlow {
    async fn call(&self, _ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        Err(FlowError::Business("duplicate invoice".into()))
    }
}

#[tokio::test]
async fn test_business_fault_is_terminal() {
    let runtime = runtime("biller")
        .register("reject", false, |_args| {
            Ok(Box::new(RejectedFlow) as Box<dyn Flow>)
        })
        .build()
        .await
        .unwrap();

    let run_id = runtime.start_flow("reject", Vec::new()).await.unwrap();
    let result = runtime.result(run_id).await;
    assert!(matches!(
        result,
        Err(EngineError::Flow(FlowError::Business(_)))
    ));

    wait_for_status(&runtime, run_id, FlowStatus::Failed).await;
    let records = runtime.medical_history(run_id).await;
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].outcome, Diagnosis::Terminal));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_operator_retry_revives_a_quarantined_run() {
    let attempts = Arc::new(AtomicU32::new(0));
    let runtime = flaky_runtime(4, 0, Arc::clone(&attempts)).await;

    let run_id = runtime.start_flow("flaky", Vec::new()).await.unwrap();
    wait_for_status(&runtime, run_id, FlowStatus::Hospitalized).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    runtime.retry(run_id).await.unwrap();
    let result = runtime.result(run_id).await.unwrap();
    assert_eq!(result, b"uploaded");
    assert_eq!(attempts.load(Ordering::SeqCst), 5);

    // The completed run's row is gone.
    assert!(matches!(
        runtime.status(run_id).await,
        Err(EngineError::FlowNotFound(_))
    ));

    runtime.shutdown().await;
}
