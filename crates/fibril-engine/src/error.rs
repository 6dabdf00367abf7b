// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fibril-engine.
//!
//! Two layers: [`FlowError`] is what flow logic raises and what callers
//! awaiting a flow observe; [`EngineError`] covers engine-internal failures
//! (contract violations, database errors, checkpoint reload faults).

use serde::{Deserialize, Serialize};

use crate::state::{FlowRunId, SessionId};

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Maximum depth walked when unwrapping an error's cause chain.
const MAX_CAUSE_DEPTH: usize = 16;

/// Errors raised by or delivered to flow logic.
///
/// These are the errors a flow's `call()` may return and the errors a caller
/// awaiting a flow result may observe. They are serializable so they can be
/// recorded in checkpoints and carried across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FlowError {
    /// Transient infrastructure fault (e.g. a dropped connection).
    ///
    /// Recognized by the hospital as retryable, including when nested
    /// inside [`FlowError::Wrapped`] layers.
    #[error("transient connection failure: {0}")]
    TransientConnection(String),

    /// The caller lacks permission for the attempted operation. Never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A business/domain fault raised intentionally by flow logic. Never retried.
    #[error("{0}")]
    Business(String),

    /// A counterparty flow ended before completing the session protocol.
    #[error("session {session_id} ended unexpectedly: counterparty flow failed")]
    UnexpectedSessionEnd {
        /// The local session whose counterparty went away.
        session_id: SessionId,
    },

    /// The flow was killed by an operator.
    #[error("flow was killed")]
    Killed,

    /// Flow state failed to round-trip through serialization.
    ///
    /// Raised when restoring a checkpointed continuation into the flow's
    /// state type fails, naming the offending type.
    #[error("flow state '{type_name}' failed to round-trip: {reason}")]
    StateRoundTrip {
        /// The Rust type that failed to deserialize.
        type_name: String,
        /// The underlying serde error message.
        reason: String,
    },

    /// An error wrapping another, preserving the cause chain.
    #[error("{message}")]
    Wrapped {
        /// Context added by the wrapping layer.
        message: String,
        /// The wrapped cause.
        #[source]
        source: Box<FlowError>,
    },
}

impl FlowError {
    /// Wrap this error with an outer context message.
    pub fn wrap(self, message: impl Into<String>) -> Self {
        FlowError::Wrapped {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error, or any error in its cause chain, is a transient
    /// infrastructure fault.
    ///
    /// Walks the chain explicitly to a bounded depth; detection must not
    /// depend on how many wrapping layers an integration added.
    pub fn is_transient(&self) -> bool {
        let mut current = self;
        for _ in 0..MAX_CAUSE_DEPTH {
            match current {
                FlowError::TransientConnection(_) => return true,
                FlowError::Wrapped { source, .. } => current = source,
                _ => return false,
            }
        }
        false
    }
}

/// Engine-internal errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The transactional-boundary contract was violated during an
    /// event-processing step. Indicates a structural bug, never retried.
    #[error("transaction contract violated during '{step}': {details}")]
    ContractViolation {
        /// The step that observed the violation.
        step: String,
        /// What was expected versus found.
        details: String,
    },

    /// A database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Running embedded migrations failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Serializing or deserializing engine data failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A just-committed checkpoint could not be reloaded.
    ///
    /// Distinguishes "which flow failed to round-trip at which suspend"
    /// from a generic failure, so operators can diagnose non-reproducible
    /// in-memory state before it causes divergence on a real crash.
    #[error("checkpoint for flow '{flow_name}' failed to reload at suspend {suspend_ordinal}: {reason}")]
    CheckpointReload {
        /// The flow whose checkpoint failed to reload.
        flow_name: String,
        /// The suspend ordinal of the offending checkpoint.
        suspend_ordinal: u64,
        /// The underlying error message.
        reason: String,
    },

    /// No checkpoint or fiber exists for the given run id.
    #[error("flow run '{0}' not found")]
    FlowNotFound(FlowRunId),

    /// The requested flow name is not in the registry.
    #[error("no flow named '{0}' is registered")]
    UnknownFlow(String),

    /// The fiber for a run is no longer accepting events.
    #[error("fiber for flow run '{0}' is no longer running")]
    FiberGone(FlowRunId),

    /// A configuration value could not be parsed.
    #[error("invalid configuration for {var}: {reason}")]
    Config {
        /// The environment variable or builder field.
        var: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A flow-level error surfaced through an engine API.
    #[error(transparent)]
    Flow(#[from] FlowError),
}

impl EngineError {
    /// Shorthand for a contract violation.
    pub(crate) fn contract(step: &str, details: impl Into<String>) -> Self {
        EngineError::ContractViolation {
            step: step.to_string(),
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_detected_directly() {
        let err = FlowError::TransientConnection("connection reset".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_transient_detected_through_two_wrapping_layers() {
        let err = FlowError::TransientConnection("broker unavailable".into())
            .wrap("while publishing settlement")
            .wrap("trade finalization failed");
        assert!(err.is_transient());
    }

    #[test]
    fn test_business_error_is_not_transient() {
        assert!(!FlowError::Business("insufficient balance".into()).is_transient());
        assert!(!FlowError::PermissionDenied("not an admin".into()).is_transient());
    }

    #[test]
    fn test_wrapped_business_error_is_not_transient() {
        let err = FlowError::Business("bad request".into()).wrap("outer");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_cause_chain_depth_is_bounded() {
        let mut err = FlowError::TransientConnection("deep".into());
        for i in 0..(MAX_CAUSE_DEPTH + 4) {
            err = err.wrap(format!("layer {}", i));
        }
        // Past the bound the transient cause is no longer visible.
        assert!(!err.is_transient());
    }

    #[test]
    fn test_source_chain_is_exposed() {
        use std::error::Error as _;
        let err = FlowError::TransientConnection("reset".into()).wrap("outer");
        let source = err.source().expect("wrapped error should expose source");
        assert_eq!(source.to_string(), "transient connection failure: reset");
    }

    #[test]
    fn test_flow_error_round_trips_through_json() {
        let err = FlowError::UnexpectedSessionEnd {
            session_id: SessionId::new(),
        };
        let bytes = serde_json::to_vec(&err).unwrap();
        let back: FlowError = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(err, back);
    }
}
