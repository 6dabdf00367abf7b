// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core data model: identifiers, flow status, checkpoints, and the
//! per-fiber state machine record.
//!
//! A committed [`Checkpoint`] must be sufficient, alone, to resume its flow
//! after total process loss; everything the engine needs to re-derive a
//! fiber lives inside it. [`StateMachineState`] adds the in-memory-only
//! bookkeeping that is deliberately *not* durable (kill flag, sender
//! identity, soft locks).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;
use crate::session::SessionState;

/// Stable identifier for one flow instance. Survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowRunId(Uuid);

impl FlowRunId {
    /// Allocate a fresh run id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for FlowRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for FlowRunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for FlowRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FlowRunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier for one end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocate a fresh session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable per-sender identity used for session message deduplication.
///
/// Set to a fixed fresh value for newly started flows; deliberately left
/// unset for flows restored from checkpoint, since redundant delivery after
/// a crash cannot be safely deduplicated with a sender-local counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderId(Uuid);

impl SenderId {
    /// Allocate a fresh sender id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    /// The flow is live: running or parked awaiting an event.
    Runnable,
    /// Quarantined by the hospital; checkpoint retained, awaiting operator
    /// action or an automatic re-trigger.
    Hospitalized,
    /// Terminally failed; checkpoint retained for forensics.
    Failed,
    /// Finished successfully; the checkpoint has been removed.
    Completed,
    /// Held by an operator; checkpoint retained, fiber released.
    Paused,
}

impl FlowStatus {
    /// Stable string form used in the database status column.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Runnable => "runnable",
            FlowStatus::Hospitalized => "hospitalized",
            FlowStatus::Failed => "failed",
            FlowStatus::Completed => "completed",
            FlowStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "runnable" => Ok(FlowStatus::Runnable),
            "hospitalized" => Ok(FlowStatus::Hospitalized),
            "failed" => Ok(FlowStatus::Failed),
            "completed" => Ok(FlowStatus::Completed),
            "paused" => Ok(FlowStatus::Paused),
            other => Err(format!("unknown flow status '{}'", other)),
        }
    }
}

/// The I/O request a flow suspended on.
///
/// Recorded in the checkpoint as `pending_io_request` so a restored fiber
/// knows what resumption it is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoRequest {
    /// Waiting for the next message on a session.
    Receive {
        /// The session being received from.
        session_id: SessionId,
    },
    /// Sending a message; completes in the same step, never parks.
    Send {
        /// The session being sent on.
        session_id: SessionId,
        /// The payload to deliver.
        payload: Vec<u8>,
    },
    /// Waiting for an asynchronous external operation to complete.
    ExecuteAsyncOperation {
        /// Stable deduplication id handed to the external system.
        ///
        /// Derived from the run id and suspend ordinal, so a retried flow
        /// re-issues the operation with the same id while a later suspend
        /// gets a new one.
        dedup_id: String,
    },
    /// Durable sleep for the given duration.
    Sleep {
        /// Sleep duration in milliseconds.
        duration_ms: u64,
    },
    /// An explicit checkpoint force with no external wait.
    ForceCheckpoint,
    /// Waiting for close confirmations from all session counterparties.
    WaitForSessionConfirmations,
}

impl IoRequest {
    /// Whether `other` is a resumption-compatible re-issue of this request.
    ///
    /// Used when a restored flow replays up to its suspend point and
    /// re-arms: the re-issued request must target the same wait.
    pub fn matches(&self, other: &IoRequest) -> bool {
        match (self, other) {
            (IoRequest::Receive { session_id: a }, IoRequest::Receive { session_id: b }) => a == b,
            (
                IoRequest::ExecuteAsyncOperation { dedup_id: a },
                IoRequest::ExecuteAsyncOperation { dedup_id: b },
            ) => a == b,
            (IoRequest::Sleep { .. }, IoRequest::Sleep { .. }) => true,
            (IoRequest::ForceCheckpoint, IoRequest::ForceCheckpoint) => true,
            (IoRequest::WaitForSessionConfirmations, IoRequest::WaitForSessionConfirmations) => {
                true
            }
            _ => false,
        }
    }
}

/// One frame of the sub-flow stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubFlowEntry {
    /// Registered name of the sub-flow.
    pub flow_name: String,
    /// Whether the sub-flow is safe to re-execute in full from its start.
    pub is_idempotent: bool,
}

/// Context captured when the flow was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    /// Who or what started the flow (participant name, operator, peer).
    pub started_by: String,
    /// When the flow was started.
    pub started_at: DateTime<Utc>,
    /// For responder flows, the local session opened by the initiating
    /// counterparty. Durable so a restored responder still knows its
    /// inbound session.
    pub initiated_by: Option<SessionId>,
}

/// Durable snapshot sufficient to resume a flow from its last suspend.
///
/// Rewritten on every persisting suspend; deleted on successful terminal
/// finish; retained under `Hospitalized`/`Failed` for inspection or manual
/// replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Registered name of the root flow.
    pub flow_name: String,
    /// Whether the root flow is marked idempotent.
    pub flow_is_idempotent: bool,
    /// Serialized start arguments, replayed to the flow factory on every
    /// respawn.
    pub start_args: Vec<u8>,
    /// The serialized continuation: the flow's own state object, as last
    /// handed to a suspending operation. The only durable representation
    /// of "where execution is".
    pub continuation: Vec<u8>,
    /// Context captured at flow start.
    pub invocation_context: InvocationContext,
    /// Stack of nested sub-flow frames, innermost last.
    pub sub_flow_stack: Vec<SubFlowEntry>,
    /// The I/O request the flow is suspended on, if parked.
    pub pending_io_request: Option<IoRequest>,
    /// Lifecycle status.
    pub status: FlowStatus,
    /// Last progress step reported by the flow, for observability.
    pub progress_step: Option<String>,
    /// Errors recorded against this flow, oldest first.
    pub errors: Vec<FlowError>,
    /// Count of persisting suspends performed so far.
    pub suspend_ordinal: u64,
    /// Open sessions keyed by local session id.
    pub sessions: HashMap<SessionId, SessionState>,
}

impl Checkpoint {
    /// Build the initial checkpoint written at flow start.
    pub fn initial(flow_name: &str, is_idempotent: bool, started_by: &str) -> Self {
        Checkpoint {
            flow_name: flow_name.to_string(),
            flow_is_idempotent: is_idempotent,
            start_args: Vec::new(),
            continuation: Vec::new(),
            invocation_context: InvocationContext {
                started_by: started_by.to_string(),
                started_at: Utc::now(),
                initiated_by: None,
            },
            sub_flow_stack: Vec::new(),
            pending_io_request: None,
            status: FlowStatus::Runnable,
            progress_step: None,
            errors: Vec::new(),
            suspend_ordinal: 0,
            sessions: HashMap::new(),
        }
    }

    /// Whether execution is currently inside an idempotent boundary: either
    /// the root flow is idempotent or any frame on the sub-flow stack is.
    ///
    /// Incremental checkpoints are elided inside idempotent boundaries;
    /// replaying their side effects is wasted work, not unsafe, by the
    /// idempotency contract.
    pub fn contains_idempotent(&self) -> bool {
        self.flow_is_idempotent || self.sub_flow_stack.iter().any(|f| f.is_idempotent)
    }
}

/// Per-fiber mutable record: the current checkpoint plus in-memory-only
/// execution bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMachineState {
    /// The current checkpoint (not necessarily persisted yet).
    pub checkpoint: Checkpoint,
    /// Whether flow logic is currently running (as opposed to parked).
    pub is_flow_resumed: bool,
    /// Whether at least one checkpoint has been committed for this run.
    pub is_any_checkpoint_persisted: bool,
    /// Kill flag. Monotonic: once true it must never flip back, and no
    /// `Resume` continuation may be issued afterwards.
    pub is_killed: bool,
    /// Whether the flow has been removed from the engine (terminal).
    pub is_removed: bool,
    /// Soft-locked resource references held by this fiber; released as part
    /// of finalization, including on abnormal termination.
    pub soft_locked_refs: HashSet<Uuid>,
    /// Sender identity for session deduplication. `None` after a restore.
    pub sender_id: Option<SenderId>,
    /// Whether the reload-after-suspend policy is active for this fiber.
    pub reload_after_suspend: bool,
    /// Result held back while waiting for session close confirmations.
    pub pending_finish: Option<Vec<u8>>,
}

impl StateMachineState {
    /// Fresh state for a newly started flow. Carries a fixed sender id.
    pub fn fresh(checkpoint: Checkpoint, reload_after_suspend: bool) -> Self {
        StateMachineState {
            checkpoint,
            is_flow_resumed: true,
            is_any_checkpoint_persisted: false,
            is_killed: false,
            is_removed: false,
            soft_locked_refs: HashSet::new(),
            sender_id: Some(SenderId::new()),
            reload_after_suspend,
            pending_finish: None,
        }
    }

    /// State re-derived from a committed checkpoint.
    ///
    /// The sender id is intentionally absent: after a crash the engine
    /// cannot prove which messages the counterparty already saw, so
    /// sender-counter deduplication is disabled for the restored run.
    pub fn restored(checkpoint: Checkpoint, reload_after_suspend: bool) -> Self {
        StateMachineState {
            checkpoint,
            is_flow_resumed: false,
            is_any_checkpoint_persisted: true,
            is_killed: false,
            is_removed: false,
            soft_locked_refs: HashSet::new(),
            sender_id: None,
            reload_after_suspend,
            pending_finish: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_status_round_trips_through_str() {
        for status in [
            FlowStatus::Runnable,
            FlowStatus::Hospitalized,
            FlowStatus::Failed,
            FlowStatus::Completed,
            FlowStatus::Paused,
        ] {
            let parsed: FlowStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("sleeping".parse::<FlowStatus>().is_err());
    }

    #[test]
    fn test_run_id_round_trips_through_str() {
        let id = FlowRunId::new();
        let parsed: FlowRunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_contains_idempotent_checks_root_and_stack() {
        let mut cp = Checkpoint::initial("trade", false, "test");
        assert!(!cp.contains_idempotent());

        cp.sub_flow_stack.push(SubFlowEntry {
            flow_name: "notarize".into(),
            is_idempotent: true,
        });
        assert!(cp.contains_idempotent());

        cp.sub_flow_stack.clear();
        cp.flow_is_idempotent = true;
        assert!(cp.contains_idempotent());
    }

    #[test]
    fn test_io_request_matching() {
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        assert!(
            IoRequest::Receive { session_id: s1 }.matches(&IoRequest::Receive { session_id: s1 })
        );
        assert!(
            !IoRequest::Receive { session_id: s1 }.matches(&IoRequest::Receive { session_id: s2 })
        );
        assert!(IoRequest::Sleep { duration_ms: 5 }.matches(&IoRequest::Sleep { duration_ms: 9 }));
        assert!(!IoRequest::ForceCheckpoint.matches(&IoRequest::WaitForSessionConfirmations));
    }

    #[test]
    fn test_fresh_state_has_sender_id_restored_does_not() {
        let cp = Checkpoint::initial("trade", false, "test");
        let fresh = StateMachineState::fresh(cp.clone(), false);
        assert!(fresh.sender_id.is_some());
        assert!(!fresh.is_any_checkpoint_persisted);

        let restored = StateMachineState::restored(cp, false);
        assert!(restored.sender_id.is_none());
        assert!(restored.is_any_checkpoint_persisted);
        assert!(!restored.is_flow_resumed);
    }

    #[test]
    fn test_checkpoint_round_trips_through_json() {
        let mut cp = Checkpoint::initial("trade", true, "alice");
        cp.continuation = serde_json::to_vec(&("phase", 3)).unwrap();
        cp.progress_step = Some("signing".into());
        cp.errors.push(FlowError::Business("rejected".into()));
        let bytes = serde_json::to_vec(&cp).unwrap();
        let back: Checkpoint = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, cp);
    }
}
