// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events consumed by the transition engine, the actions it emits, and the
//! continuation it hands back to the fiber.

use crate::error::FlowError;
use crate::session::SessionMessage;
use crate::state::{FlowStatus, IoRequest, SessionId};

/// An event on a fiber's queue.
///
/// Producers: the flow's own suspend calls, the session router, timers,
/// async-result callbacks, the hospital, and the operator surface. Events
/// for one flow are processed strictly one at a time, in FIFO order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The flow called a suspending operation.
    Suspend {
        /// What the flow is waiting for.
        io_request: IoRequest,
        /// Serialized continuation captured at the suspend point.
        checkpoint_bytes: Vec<u8>,
        /// Skip persistence for this suspend (send-only operations).
        may_skip_checkpoint: bool,
    },
    /// Flow logic returned successfully.
    FlowFinish {
        /// The flow's result bytes.
        result: Vec<u8>,
    },
    /// Flow logic raised an error.
    Error {
        /// The error raised.
        cause: FlowError,
        /// Whether the flow has at least one committed checkpoint to
        /// return to. Uninitialized flows propagate immediately; the
        /// hospital only treats initialized ones.
        was_initialized: bool,
    },
    /// The flow is entering a nested sub-flow.
    EnterSubFlow {
        /// Registered name of the sub-flow.
        flow_name: String,
        /// Whether the sub-flow is idempotent.
        is_idempotent: bool,
        /// Whether the sub-flow is a timed flow.
        is_timed: bool,
    },
    /// The flow is leaving the innermost sub-flow.
    LeaveSubFlow,
    /// The flow is opening a session to a counterparty.
    InitiateFlow {
        /// Destination participant name.
        destination: String,
        /// Responder flow to start on the destination.
        responder_flow: String,
        /// Pre-allocated local session id.
        session_id: SessionId,
    },
    /// The router delivered a session message for this flow.
    DeliverSessionMessage {
        /// The local session the message belongs to.
        session_id: SessionId,
        /// The counterparty's session id.
        peer_session: SessionId,
        /// The message.
        message: SessionMessage,
    },
    /// An asynchronous external operation completed successfully.
    AsyncOperationCompletion {
        /// The operation's result bytes.
        result: Vec<u8>,
    },
    /// An asynchronous external operation failed.
    AsyncOperationThrows {
        /// The operation's error.
        error: FlowError,
    },
    /// Discard unpersisted progress and resume from the last committed
    /// checkpoint.
    RetryFlowFromSafePoint,
    /// Begin terminal error propagation to all session counterparties.
    StartErrorPropagation,
    /// An operator killed the flow.
    KillFlow,
    /// An operator paused the flow.
    Pause,
    /// A durable sleep elapsed.
    WakeUp,
}

/// An effect ordered by the transition engine.
///
/// Interpreted in order by the action executor against real infrastructure.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write the given checkpoint under the ambient transaction.
    ///
    /// Carries its own snapshot: the state captured at the suspend point,
    /// which may differ from the post-transition in-memory state (e.g. a
    /// buffered message consumed in the same step stays in the snapshot so
    /// a crash replays its delivery).
    PersistCheckpoint {
        /// The snapshot to persist.
        checkpoint: Box<crate::state::Checkpoint>,
    },
    /// Delete the checkpoint under the ambient transaction.
    RemoveCheckpoint,
    /// Commit the ambient transaction.
    CommitTransaction,
    /// Roll back the ambient transaction.
    RollbackTransaction,
    /// Send a message on a session. Emitted after the commit that made the
    /// decision durable.
    SendSessionMessage {
        /// The local session to send on.
        session_id: SessionId,
        /// The message.
        message: SessionMessage,
        /// Outbound sequence number for this message.
        seq: u64,
    },
    /// Enqueue an event back onto this fiber's queue after a delay.
    ScheduleEvent {
        /// The event to deliver.
        event: Box<Event>,
        /// Delay before delivery, in milliseconds.
        delay_ms: u64,
    },
    /// Release all soft-locked resource references held by this fiber.
    ReleaseSoftLocks,
    /// Update the status column for this run under the ambient transaction.
    UpdateFlowStatus {
        /// The new status.
        status: FlowStatus,
    },
    /// Hand the flow to the hospital for triage.
    TriageFlow,
    /// Re-derive execution state from the last committed checkpoint and
    /// respawn flow logic from it.
    RespawnFromCheckpoint,
    /// The fiber is done; remove it from the runtime's table.
    RemoveFlow,
}

/// What the fiber should do after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowContinuation {
    /// Deliver a value to the parked suspend call, or resolve the flow's
    /// outcome when no suspend is pending.
    Resume {
        /// The value to deliver.
        value: Vec<u8>,
    },
    /// Deliver an error to the parked suspend call, or resolve the flow's
    /// outcome as failed when no suspend is pending.
    Throw {
        /// The error to deliver.
        error: FlowError,
    },
    /// Nothing to deliver; keep processing events.
    ProcessEvents,
    /// The fiber must never resume. Park forever, consuming nothing.
    Abort,
}
