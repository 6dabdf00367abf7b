// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transitions for the failure family: errors raised by flow logic, terminal
//! error propagation, retry from the last committed checkpoint, and operator
//! kill.

use super::{TransitionContext, TransitionResult};
use crate::error::{EngineError, FlowError, Result};
use crate::events::{Action, Event};
use crate::session::{SessionMessage, SessionStatus};
use crate::state::{FlowStatus, SessionId, StateMachineState};

pub(super) fn transition(event: &Event, state: &StateMachineState) -> Result<TransitionResult> {
    let ctx = TransitionContext::new(state);
    match event {
        Event::Error {
            cause,
            was_initialized,
        } => {
            if state.is_killed || state.is_removed {
                return Ok(ctx.abort_rolled_back());
            }
            flow_errored(ctx, cause.clone(), *was_initialized)
        }
        Event::StartErrorPropagation => {
            if state.is_killed || state.is_removed {
                return Ok(ctx.abort_rolled_back());
            }
            propagate(ctx)
        }
        Event::RetryFlowFromSafePoint => {
            if state.is_killed || state.is_removed {
                return Ok(ctx.abort_rolled_back());
            }
            retry_from_safe_point(ctx)
        }
        Event::KillFlow => kill(ctx),
        other => Err(EngineError::contract(
            "failure_transition",
            format!("unexpected event {:?}", other),
        )),
    }
}

fn flow_errored(
    mut ctx: TransitionContext,
    cause: FlowError,
    was_initialized: bool,
) -> Result<TransitionResult> {
    ctx.state.checkpoint.errors.push(cause);
    if !was_initialized {
        // No committed checkpoint to return to; propagate straight away.
        return propagate(ctx);
    }
    // Discard the failed step's writes and hand the run to the hospital.
    ctx.rollback();
    ctx.action(Action::TriageFlow);
    ctx.state.is_flow_resumed = false;
    Ok(ctx.process_events())
}

/// Terminal failure: record the failed checkpoint, tell every live
/// counterparty, release held resources, and drop the fiber.
fn propagate(mut ctx: TransitionContext) -> Result<TransitionResult> {
    let error = ctx
        .state
        .checkpoint
        .errors
        .last()
        .cloned()
        .unwrap_or_else(|| FlowError::Business("flow failed with no recorded error".into()));
    ctx.state.checkpoint.status = FlowStatus::Failed;
    let notify = mark_sessions_errored(&mut ctx);
    // Failed checkpoints are retained for inspection.
    ctx.persist_current();
    ctx.action(Action::ReleaseSoftLocks);
    ctx.commit();
    for id in notify {
        ctx.send_on_session(
            id,
            SessionMessage::ErrorEnd {
                error: error.clone(),
            },
        );
    }
    ctx.action(Action::RemoveFlow);
    ctx.state.is_removed = true;
    Ok(ctx.throw(error))
}

fn retry_from_safe_point(mut ctx: TransitionContext) -> Result<TransitionResult> {
    ctx.state.checkpoint.status = FlowStatus::Runnable;
    ctx.action(Action::UpdateFlowStatus {
        status: FlowStatus::Runnable,
    });
    ctx.commit();
    // Executed after the commit so the respawn reads the durable state.
    ctx.action(Action::RespawnFromCheckpoint);
    ctx.state.is_flow_resumed = false;
    Ok(ctx.process_events())
}

fn kill(mut ctx: TransitionContext) -> Result<TransitionResult> {
    if ctx.state.is_removed {
        return Ok(ctx.abort_rolled_back());
    }
    // Monotonic: set once, never cleared, and no Resume may follow.
    ctx.state.is_killed = true;
    ctx.state.checkpoint.status = FlowStatus::Failed;
    ctx.state.checkpoint.errors.push(FlowError::Killed);
    let notify = mark_sessions_errored(&mut ctx);
    ctx.action(Action::RemoveCheckpoint);
    ctx.action(Action::ReleaseSoftLocks);
    ctx.commit();
    for id in notify {
        ctx.send_on_session(
            id,
            SessionMessage::ErrorEnd {
                error: FlowError::Killed,
            },
        );
    }
    ctx.action(Action::RemoveFlow);
    ctx.state.is_removed = true;
    Ok(ctx.throw(FlowError::Killed))
}

/// Mark every non-terminal session errored and return their ids in a stable
/// order for deterministic send emission.
fn mark_sessions_errored(ctx: &mut TransitionContext) -> Vec<SessionId> {
    let mut notify: Vec<SessionId> = ctx
        .state
        .checkpoint
        .sessions
        .iter()
        .filter(|(_, s)| !matches!(s.status, SessionStatus::Closed | SessionStatus::Errored))
        .map(|(id, _)| *id)
        .collect();
    notify.sort();
    for id in &notify {
        if let Some(session) = ctx.state.checkpoint.sessions.get_mut(id) {
            session.status = SessionStatus::Errored;
        }
    }
    notify
}
