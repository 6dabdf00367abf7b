// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The closed set of flows a runtime can start.
//!
//! Flow names are registered once at build time. Respawns and responder
//! starts resolve through here; an unregistered name is an error, never a
//! dynamic load.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Flow;
use crate::error::{EngineError, Result};

/// Builds a fresh [`Flow`] instance from serialized start arguments.
///
/// Called again on every respawn; the instance itself carries no progress,
/// that lives in the checkpointed state.
pub type FlowFactory = Arc<dyn Fn(Vec<u8>) -> Result<Box<dyn Flow>> + Send + Sync>;

/// A registered flow.
#[derive(Clone)]
pub struct FlowDefinition {
    /// Factory for instances of this flow.
    pub factory: FlowFactory,
    /// Whether the flow is safe to re-execute in full from its start.
    /// Idempotent flows get no incremental checkpoints.
    pub is_idempotent: bool,
}

/// Name-to-definition table, fixed after runtime build.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    flows: HashMap<String, FlowDefinition>,
}

impl FlowRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow under `name`. Re-registering a name replaces the
    /// previous definition.
    pub fn register<F>(&mut self, name: &str, is_idempotent: bool, factory: F)
    where
        F: Fn(Vec<u8>) -> Result<Box<dyn Flow>> + Send + Sync + 'static,
    {
        self.flows.insert(
            name.to_string(),
            FlowDefinition {
                factory: Arc::new(factory),
                is_idempotent,
            },
        );
    }

    /// Look up a flow by name.
    pub fn get(&self, name: &str) -> Result<&FlowDefinition> {
        self.flows
            .get(name)
            .ok_or_else(|| EngineError::UnknownFlow(name.to_string()))
    }

    /// Registered flow names, for diagnostics.
    pub fn names(&self) -> Vec<&str> {
        self.flows.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FlowContext;
    use crate::error::FlowError;
    use async_trait::async_trait;

    struct NoopFlow;

    #[async_trait]
    impl Flow for NoopFlow {
        async fn call(
            &self,
            _ctx: &mut FlowContext,
        ) -> std::result::Result<Vec<u8>, FlowError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_lookup_resolves_registered_flow() {
        let mut registry = FlowRegistry::new();
        registry.register("trade", false, |_args| Ok(Box::new(NoopFlow)));

        let definition = registry.get("trade").unwrap();
        assert!(!definition.is_idempotent);
        assert!((definition.factory)(Vec::new()).is_ok());
    }

    #[test]
    fn test_unknown_flow_is_an_error() {
        let registry = FlowRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(EngineError::UnknownFlow(_))
        ));
    }
}
