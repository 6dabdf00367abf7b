// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flaky Upload - transient failures and hospital retries.
//!
//! This example shows:
//! - An external operation run through `execute_async` with a stable
//!   deduplication id
//! - Transient faults retried from the last checkpoint with backoff
//! - The medical history recorded for the run
//!
//! Run with: cargo run -p fibril-flows --bin flaky_upload

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use fibril_engine::{EngineConfig, Flow, FlowContext, FlowError, FlowRuntimeBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Checkpointed upload state. The manifest is written once; retries resume
/// past it.
#[derive(Debug, Default, Serialize, Deserialize)]
struct UploadState {
    manifest_written: bool,
}

struct FlakyUpload {
    /// Shared across respawns so the simulated warehouse can recover.
    attempts: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Flow for FlakyUpload {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let mut state: UploadState = ctx.restored_state()?.unwrap_or_default();

        if !state.manifest_written {
            ctx.progress("writing manifest").await?;
            info!("writing upload manifest");
            state.manifest_written = true;
            ctx.checkpoint(&state).await?;
        }

        ctx.progress("uploading archive").await?;
        let attempts = Arc::clone(&self.attempts);
        let receipt = ctx
            .execute_async(&state, move |dedup_id| async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                info!(attempt, dedup_id = %dedup_id, "contacting warehouse");
                if attempt < 3 {
                    return Err(FlowError::TransientConnection(
                        "warehouse unreachable".into(),
                    ));
                }
                serde_json::to_vec(&serde_json::json!({
                    "receipt": dedup_id,
                    "attempt": attempt,
                }))
                .map_err(|e| FlowError::Business(e.to_string()))
            })
            .await?;

        Ok(receipt)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("=== Flaky Upload: Transient Retries ===");

    let attempts = Arc::new(AtomicU32::new(0));
    let factory_attempts = Arc::clone(&attempts);
    let runtime = FlowRuntimeBuilder::new(
        EngineConfig::new("uploader").with_retry_base_delay_ms(100),
    )
    .register("flaky_upload", false, move |_args| {
        Ok(Box::new(FlakyUpload {
            attempts: Arc::clone(&factory_attempts),
        }) as Box<dyn Flow>)
    })
    .build()
    .await?;

    let run_id = runtime.start_flow("flaky_upload", Vec::new()).await?;
    info!(run_id = %run_id, "upload started");

    let outcome = runtime.result(run_id).await?;
    let receipt: serde_json::Value = serde_json::from_slice(&outcome)?;
    info!(receipt = %receipt, attempts = attempts.load(Ordering::SeqCst), "upload succeeded");

    for record in runtime.medical_history(run_id).await {
        info!(
            attempt = record.attempt,
            error = %record.error,
            outcome = ?record.outcome,
            at = %record.at,
            "hospital admission"
        );
    }

    runtime.shutdown().await;
    info!("=== Flaky Upload Complete ===");
    Ok(())
}
