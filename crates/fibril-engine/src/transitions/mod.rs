// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The state transition engine.
//!
//! A pure, deterministic function from `(Event, StateMachineState)` to
//! `(ordered Actions, FlowContinuation, new StateMachineState)`. No I/O, no
//! clock, no randomness: given the same inputs it always produces the same
//! outputs, which is what makes checkpoint-and-replay safe.
//!
//! Lifecycle events (suspend, finish, sessions, sub-flows) live in
//! [`top_level`]; the failure family (errors, propagation, retry, kill)
//! lives in [`failure`].

mod failure;
mod top_level;

use crate::error::Result;
use crate::events::{Action, Event, FlowContinuation};
use crate::session::SessionMessage;
use crate::state::{Checkpoint, StateMachineState};

/// Output of one transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    /// Effects to interpret, in order.
    pub actions: Vec<Action>,
    /// What the fiber should do next.
    pub continuation: FlowContinuation,
    /// The updated state machine state.
    pub state: StateMachineState,
}

/// Run one event through the engine.
pub fn transition(event: &Event, state: &StateMachineState) -> Result<TransitionResult> {
    match event {
        Event::Error { .. }
        | Event::StartErrorPropagation
        | Event::RetryFlowFromSafePoint
        | Event::KillFlow => failure::transition(event, state),
        _ => top_level::transition(event, state),
    }
}

/// Accumulator for building a [`TransitionResult`].
///
/// Owns a working copy of the state; transition functions mutate it and
/// push actions, then seal the result with a continuation.
pub(crate) struct TransitionContext {
    pub(crate) state: StateMachineState,
    actions: Vec<Action>,
}

impl TransitionContext {
    pub(crate) fn new(state: &StateMachineState) -> Self {
        TransitionContext {
            state: state.clone(),
            actions: Vec::new(),
        }
    }

    pub(crate) fn action(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Snapshot the current checkpoint into a `PersistCheckpoint` action
    /// and record that a checkpoint has been persisted.
    pub(crate) fn persist_current(&mut self) {
        let snapshot = Box::new(self.state.checkpoint.clone());
        self.actions.push(Action::PersistCheckpoint {
            checkpoint: snapshot,
        });
        self.state.is_any_checkpoint_persisted = true;
    }

    pub(crate) fn commit(&mut self) {
        self.actions.push(Action::CommitTransaction);
    }

    pub(crate) fn rollback(&mut self) {
        self.actions.push(Action::RollbackTransaction);
    }

    /// Queue an outbound session message, consuming one sequence number.
    ///
    /// Returns false when the session is unknown; callers decide how to
    /// surface that.
    pub(crate) fn send_on_session(
        &mut self,
        session_id: crate::state::SessionId,
        message: SessionMessage,
    ) -> bool {
        let Some(session) = self.state.checkpoint.sessions.get_mut(&session_id) else {
            return false;
        };
        let seq = session.next_send_seq;
        session.next_send_seq += 1;
        self.actions.push(Action::SendSessionMessage {
            session_id,
            message,
            seq,
        });
        true
    }

    pub(crate) fn resume(self, value: Vec<u8>) -> TransitionResult {
        self.seal(FlowContinuation::Resume { value })
    }

    pub(crate) fn throw(self, error: crate::error::FlowError) -> TransitionResult {
        self.seal(FlowContinuation::Throw { error })
    }

    pub(crate) fn park(mut self) -> TransitionResult {
        self.state.is_flow_resumed = false;
        self.seal(FlowContinuation::ProcessEvents)
    }

    pub(crate) fn process_events(self) -> TransitionResult {
        self.seal(FlowContinuation::ProcessEvents)
    }

    /// Close the ambient transaction with a rollback and abort the fiber.
    /// Used for events reaching a killed or removed flow.
    pub(crate) fn abort_rolled_back(mut self) -> TransitionResult {
        self.rollback();
        self.seal(FlowContinuation::Abort)
    }

    /// Commit the ambient transaction and abort the fiber while keeping its
    /// durable state in place. Used for operator pause.
    pub(crate) fn abort_committed(mut self) -> TransitionResult {
        self.commit();
        self.seal(FlowContinuation::Abort)
    }

    fn seal(self, continuation: FlowContinuation) -> TransitionResult {
        TransitionResult {
            actions: self.actions,
            continuation,
            state: self.state,
        }
    }
}

/// Shared terminal-finish bundle: remove the checkpoint, release locks,
/// commit, drop the fiber.
pub(crate) fn finish_actions(ctx: &mut TransitionContext) {
    ctx.state.checkpoint.status = crate::state::FlowStatus::Completed;
    ctx.action(Action::RemoveCheckpoint);
    ctx.action(Action::ReleaseSoftLocks);
    ctx.commit();
    ctx.action(Action::RemoveFlow);
    ctx.state.is_removed = true;
}

/// Whether every session has reached a terminal status.
pub(crate) fn all_sessions_terminal(checkpoint: &Checkpoint) -> bool {
    use crate::session::SessionStatus;
    checkpoint
        .sessions
        .values()
        .all(|s| matches!(s.status, SessionStatus::Closed | SessionStatus::Errored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Checkpoint, IoRequest, StateMachineState};

    fn runnable_state() -> StateMachineState {
        StateMachineState::fresh(Checkpoint::initial("trade", false, "test"), false)
    }

    #[test]
    fn test_transition_is_deterministic() {
        let state = runnable_state();
        let event = Event::Suspend {
            io_request: IoRequest::ForceCheckpoint,
            checkpoint_bytes: vec![1, 2, 3],
            may_skip_checkpoint: false,
        };

        let first = transition(&event, &state).unwrap();
        let second = transition(&event, &state).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_transition_does_not_mutate_input_state() {
        let state = runnable_state();
        let before = state.clone();
        let event = Event::FlowFinish { result: vec![7] };

        let _ = transition(&event, &state).unwrap();
        assert_eq!(state, before);
    }
}
