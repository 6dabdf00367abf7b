// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch Import - checkpointed loop processing.
//!
//! This example shows:
//! - Passing the batch to the flow through its start arguments
//! - A checkpoint after every imported item
//! - Restoring state after a crash and skipping completed work
//! - Progress steps visible while the flow runs
//!
//! Run with: cargo run -p fibril-flows --bin batch_import

use std::time::Duration;

use fibril_engine::{EngineConfig, Flow, FlowContext, FlowError, FlowRuntimeBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Checkpointed import state. After a restore the loop resumes at
/// `next_index` and everything before it is skipped.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ImportState {
    next_index: usize,
    imported: Vec<String>,
    total_cents: i64,
}

struct BatchImport {
    orders: Vec<String>,
}

#[async_trait::async_trait]
impl Flow for BatchImport {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let mut state: ImportState = ctx.restored_state()?.unwrap_or_default();

        for index in state.next_index..self.orders.len() {
            let order = &self.orders[index];
            ctx.progress(&format!("importing {}", order)).await?;
            info!(index, order = %order, "importing order");

            // Simulated line-item pricing.
            let value_cents = (index as i64 + 1) * 250;

            state.imported.push(order.clone());
            state.total_cents += value_cents;
            state.next_index = index + 1;
            ctx.checkpoint(&state).await?;
        }

        ctx.progress("finalizing").await?;
        serde_json::to_vec(&serde_json::json!({
            "imported": state.imported.len(),
            "total_cents": state.total_cents,
        }))
        .map_err(|e| FlowError::Business(e.to_string()))
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

    info!("=== Batch Import: Checkpointed Loop ===");

    let runtime = FlowRuntimeBuilder::new(EngineConfig::new("importer"))
        .register("batch_import", false, |args| {
            let orders: Vec<String> = serde_json::from_slice(&args)
                .map_err(fibril_engine::EngineError::from)?;
            Ok(Box::new(BatchImport { orders }) as Box<dyn Flow>)
        })
        .build()
        .await?;

    let orders: Vec<String> = (1..=8).map(|n| format!("order-{:03}", n)).collect();
    let run_id = runtime
        .start_flow("batch_import", serde_json::to_vec(&orders)?)
        .await?;
    info!(run_id = %run_id, batch = orders.len(), "import started");

    // Peek at the stored status while the import runs.
    tokio::time::sleep(Duration::from_millis(20)).await;
    if let Ok(status) = runtime.status(run_id).await {
        info!(status = %status, "import in flight");
    }

    let outcome = runtime.result(run_id).await?;
    let summary: serde_json::Value = serde_json::from_slice(&outcome)?;
    info!(summary = %summary, "import finished");

    runtime.shutdown().await;
    info!("=== Batch Import Complete ===");
    Ok(())
}
