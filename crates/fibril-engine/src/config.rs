// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration: builder defaults plus environment loading.

use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::hospital::RetryPolicy;

/// Default checkpoint store URL: the in-process memory backend.
pub const DEFAULT_DATABASE_URL: &str = "memory";
/// Default number of hospital retries before quarantine.
pub const DEFAULT_RETRY_CEILING: u32 = 3;
/// Default base delay for the first retry, doubled per attempt.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Configuration for a [`FlowRuntime`](crate::runtime::FlowRuntime).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This runtime's participant name, used for session addressing.
    pub participant: String,
    /// Checkpoint store URL: `memory`, `sqlite:...`, or `postgres:...`.
    pub database_url: String,
    /// Hospital retries before a transient fault is quarantined.
    pub retry_ceiling: u32,
    /// Base delay before the first retry, doubled on each further attempt.
    pub retry_base_delay_ms: u64,
    /// Verify every committed checkpoint by discarding in-memory state and
    /// re-deriving the fiber from it. Diagnostic mode; off by default.
    pub reload_after_suspend: bool,
    /// Treat every flow error as terminal instead of triaging it.
    pub strict_triage: bool,
}

impl EngineConfig {
    /// Configuration with defaults for the given participant.
    pub fn new(participant: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            reload_after_suspend: false,
            strict_triage: false,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FIBRIL_PARTICIPANT`: this runtime's participant name
    ///
    /// Optional (with defaults):
    /// - `FIBRIL_DATABASE_URL`: checkpoint store URL (default: `memory`)
    /// - `FIBRIL_RETRY_CEILING`: hospital retries before quarantine (default: 3)
    /// - `FIBRIL_RETRY_BASE_DELAY_MS`: first retry delay (default: 1000)
    /// - `FIBRIL_RELOAD_AFTER_SUSPEND`: `true`/`1` to enable (default: false)
    /// - `FIBRIL_STRICT_TRIAGE`: `true`/`1` to enable (default: false)
    pub fn from_env() -> Result<Self> {
        let participant = std::env::var("FIBRIL_PARTICIPANT").map_err(|_| EngineError::Config {
            var: "FIBRIL_PARTICIPANT".to_string(),
            reason: "required environment variable is not set".to_string(),
        })?;

        let database_url = std::env::var("FIBRIL_DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let retry_ceiling = parse_var("FIBRIL_RETRY_CEILING", DEFAULT_RETRY_CEILING)?;
        let retry_base_delay_ms =
            parse_var("FIBRIL_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?;
        let reload_after_suspend = flag_var("FIBRIL_RELOAD_AFTER_SUSPEND");
        let strict_triage = flag_var("FIBRIL_STRICT_TRIAGE");

        Ok(Self {
            participant,
            database_url,
            retry_ceiling,
            retry_base_delay_ms,
            reload_after_suspend,
            strict_triage,
        })
    }

    /// Set the checkpoint store URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Set the hospital retry ceiling.
    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    /// Set the base delay before the first retry.
    pub fn with_retry_base_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_base_delay_ms = delay_ms;
        self
    }

    /// Enable checkpoint reload verification after every persisting suspend.
    pub fn with_reload_after_suspend(mut self, enabled: bool) -> Self {
        self.reload_after_suspend = enabled;
        self
    }

    /// Make every flow error terminal, bypassing hospital triage.
    pub fn with_strict_triage(mut self, enabled: bool) -> Self {
        self.strict_triage = enabled;
        self
    }

    /// The hospital retry policy this configuration describes.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ceiling: self.retry_ceiling,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &str, default: T) -> Result<T> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| EngineError::Config {
            var: var.to_string(),
            reason: format!("'{}' is not a valid value", raw),
        }),
    }
}

fn flag_var(var: &str) -> bool {
    std::env::var(var)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}
