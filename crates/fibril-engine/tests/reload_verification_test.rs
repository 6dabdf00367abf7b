// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reload-after-suspend mode: every persisting checkpoint forces a reload
//! from the store and a respawn, proving the persisted state is sufficient
//! to continue.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::*;
use fibril_engine::{EngineConfig, Flow, FlowContext, FlowError, FlowRuntimeBuilder, ReloadHook};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CounterState {
    done: usize,
}

/// Checkpoints before each unit of work so a reload replays the pending
/// checkpoint and continues from it.
struct CountingFlow;

#[async_trait::async_trait]
impl Flow for CountingFlow {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let mut state: CounterState = ctx.restored_state()?.unwrap_or_default();
        for step in state.done..3 {
            ctx.checkpoint(&state).await?;
            state.done = step + 1;
        }
        Ok(b"done".to_vec())
    }
}

#[tokio::test]
async fn test_every_persisting_checkpoint_respawns_the_fiber() {
    let spawns = Arc::new(AtomicU32::new(0));
    let hook_spawns = Arc::clone(&spawns);
    let hook: ReloadHook = Arc::new(move |_run_id| {
        hook_spawns.fetch_add(1, Ordering::SeqCst);
    });

    let runtime = FlowRuntimeBuilder::new(
        EngineConfig::new("verifier")
            .with_retry_base_delay_ms(1)
            .with_reload_after_suspend(true),
    )
    .register("counting", false, |_args| {
        Ok(Box::new(CountingFlow) as Box<dyn Flow>)
    })
    .with_reload_hook(hook)
    .build()
    .await
    .unwrap();

    let run_id = runtime.start_flow("counting", Vec::new()).await.unwrap();
    let result = runtime.result(run_id).await.unwrap();
    assert_eq!(result, b"done");

    // One initial spawn plus one respawn per persisted checkpoint.
    assert_eq!(spawns.load(Ordering::SeqCst), 4);

    runtime.shutdown().await;
}
