// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared harness for runtime integration tests.

#![allow(dead_code)]

use std::time::Duration;

use fibril_engine::{EngineConfig, FlowRunId, FlowRuntime, FlowRuntimeBuilder, FlowStatus};

/// A runtime builder with retry delays short enough for tests.
pub fn runtime(participant: &str) -> FlowRuntimeBuilder {
    FlowRuntimeBuilder::new(EngineConfig::new(participant).with_retry_base_delay_ms(1))
}

/// Poll a run's stored status until it matches, panicking after 5 seconds.
pub async fn wait_for_status(runtime: &FlowRuntime, run_id: FlowRunId, expected: FlowStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(status) = runtime.status(run_id).await {
            if status == expected {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {} never reached status {}",
            run_id,
            expected
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
