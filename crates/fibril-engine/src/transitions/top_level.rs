// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transitions for the ordinary flow lifecycle: suspend and resume, session
//! traffic, sub-flows, async operations, durable sleep, finish, and pause.

use super::{TransitionContext, TransitionResult, all_sessions_terminal, finish_actions};
use crate::error::{EngineError, FlowError, Result};
use crate::events::{Action, Event};
use crate::session::{BufferedItem, SessionMessage, SessionState, SessionStatus};
use crate::state::{FlowStatus, IoRequest, SessionId, StateMachineState, SubFlowEntry};

pub(super) fn transition(event: &Event, state: &StateMachineState) -> Result<TransitionResult> {
    let ctx = TransitionContext::new(state);
    if state.is_killed || state.is_removed {
        return Ok(ctx.abort_rolled_back());
    }
    match event {
        Event::Suspend {
            io_request,
            checkpoint_bytes,
            may_skip_checkpoint,
        } => suspend(ctx, io_request, checkpoint_bytes, *may_skip_checkpoint),
        Event::FlowFinish { result } => flow_finish(ctx, result.clone()),
        Event::EnterSubFlow {
            flow_name,
            is_idempotent,
            is_timed,
        } => enter_sub_flow(ctx, flow_name, *is_idempotent, *is_timed),
        Event::LeaveSubFlow => leave_sub_flow(ctx),
        Event::InitiateFlow {
            destination,
            responder_flow,
            session_id,
        } => initiate_flow(ctx, destination, responder_flow, *session_id),
        Event::DeliverSessionMessage {
            session_id,
            peer_session,
            message,
        } => deliver_session_message(ctx, *session_id, *peer_session, message.clone()),
        Event::AsyncOperationCompletion { result } => async_completion(ctx, result.clone()),
        Event::AsyncOperationThrows { error } => async_throws(ctx, error.clone()),
        Event::WakeUp => wake_up(ctx),
        Event::Pause => pause(ctx),
        other => Err(EngineError::contract(
            "top_level_transition",
            format!("unexpected event {:?}", other),
        )),
    }
}

/// Clear the pending wait and mark flow logic as running again.
fn resume_waiter(ctx: &mut TransitionContext) {
    ctx.state.checkpoint.pending_io_request = None;
    ctx.state.is_flow_resumed = true;
}

/// Whether the flow is parked on a `Receive` for the given session.
fn parked_on_receive(ctx: &TransitionContext, session_id: SessionId) -> bool {
    !ctx.state.is_flow_resumed
        && matches!(
            &ctx.state.checkpoint.pending_io_request,
            Some(IoRequest::Receive { session_id: pending }) if *pending == session_id
        )
}

fn suspend(
    mut ctx: TransitionContext,
    io_request: &IoRequest,
    checkpoint_bytes: &[u8],
    may_skip_checkpoint: bool,
) -> Result<TransitionResult> {
    if let IoRequest::Send {
        session_id,
        payload,
    } = io_request
    {
        return send_without_parking(ctx, *session_id, payload.clone());
    }

    if !ctx.state.is_flow_resumed {
        if let Some(pending) = ctx.state.checkpoint.pending_io_request.clone() {
            if !pending.matches(io_request) {
                return Err(EngineError::contract(
                    "suspend",
                    format!(
                        "replay diverged: re-issued {:?} while suspended on {:?}",
                        io_request, pending
                    ),
                ));
            }
            // Re-arm: the replayed request targets the wait already recorded
            // in the checkpoint. Nothing new to persist.
            ctx.commit();
            return complete_wait(ctx, &pending);
        }
        ctx.state.is_flow_resumed = true;
    }

    ctx.state.checkpoint.continuation = checkpoint_bytes.to_vec();
    ctx.state.checkpoint.pending_io_request = Some(io_request.clone());
    if !may_skip_checkpoint {
        let elide = ctx.state.checkpoint.contains_idempotent()
            && ctx.state.is_any_checkpoint_persisted;
        if !elide {
            ctx.state.checkpoint.suspend_ordinal += 1;
            ctx.persist_current();
        }
    }
    ctx.commit();
    complete_wait(ctx, io_request)
}

/// Decide whether a just-recorded wait can complete in the same step.
fn complete_wait(mut ctx: TransitionContext, io_request: &IoRequest) -> Result<TransitionResult> {
    match io_request {
        IoRequest::Receive { session_id } => complete_receive(ctx, *session_id),
        IoRequest::ExecuteAsyncOperation { .. } => Ok(ctx.park()),
        IoRequest::Sleep { duration_ms } => {
            ctx.action(Action::ScheduleEvent {
                event: Box::new(Event::WakeUp),
                delay_ms: *duration_ms,
            });
            Ok(ctx.park())
        }
        IoRequest::ForceCheckpoint => {
            resume_waiter(&mut ctx);
            Ok(ctx.resume(Vec::new()))
        }
        IoRequest::WaitForSessionConfirmations => {
            if all_sessions_terminal(&ctx.state.checkpoint) {
                resume_waiter(&mut ctx);
                Ok(ctx.resume(Vec::new()))
            } else {
                Ok(ctx.park())
            }
        }
        IoRequest::Send { .. } => Err(EngineError::contract("suspend", "send never parks")),
    }
}

fn complete_receive(mut ctx: TransitionContext, session_id: SessionId) -> Result<TransitionResult> {
    let (buffered, status) = match ctx.state.checkpoint.sessions.get_mut(&session_id) {
        None => {
            resume_waiter(&mut ctx);
            return Ok(ctx.throw(FlowError::Business(format!(
                "receive on unknown session {}",
                session_id
            ))));
        }
        Some(session) => (session.buffered.pop_front(), session.status),
    };
    if let Some(item) = buffered {
        resume_waiter(&mut ctx);
        return Ok(match item {
            BufferedItem::Data(payload) => ctx.resume(payload),
            BufferedItem::ErrorEnd(_) => ctx.throw(FlowError::UnexpectedSessionEnd { session_id }),
        });
    }
    match status {
        SessionStatus::Open => Ok(ctx.park()),
        SessionStatus::Errored => {
            resume_waiter(&mut ctx);
            Ok(ctx.throw(FlowError::UnexpectedSessionEnd { session_id }))
        }
        SessionStatus::Closed | SessionStatus::CloseRequested => {
            resume_waiter(&mut ctx);
            Ok(ctx.throw(FlowError::Business(format!(
                "receive on closed session {}",
                session_id
            ))))
        }
    }
}

/// Sends complete in their own step: commit the decision, emit the message
/// after the commit, and resume without writing a checkpoint.
fn send_without_parking(
    mut ctx: TransitionContext,
    session_id: SessionId,
    payload: Vec<u8>,
) -> Result<TransitionResult> {
    let status = match ctx.state.checkpoint.sessions.get(&session_id) {
        None => {
            ctx.commit();
            return Ok(ctx.throw(FlowError::Business(format!(
                "send on unknown session {}",
                session_id
            ))));
        }
        Some(session) => session.status,
    };
    match status {
        SessionStatus::Errored => {
            ctx.commit();
            Ok(ctx.throw(FlowError::UnexpectedSessionEnd { session_id }))
        }
        SessionStatus::Closed | SessionStatus::CloseRequested => {
            ctx.commit();
            Ok(ctx.throw(FlowError::Business(format!(
                "send on closed session {}",
                session_id
            ))))
        }
        SessionStatus::Open => {
            ctx.commit();
            ctx.send_on_session(session_id, SessionMessage::Data { payload });
            Ok(ctx.resume(Vec::new()))
        }
    }
}

fn flow_finish(mut ctx: TransitionContext, result: Vec<u8>) -> Result<TransitionResult> {
    if all_sessions_terminal(&ctx.state.checkpoint) {
        finish_actions(&mut ctx);
        return Ok(ctx.resume(result));
    }
    // Close is re-sent for sessions already in CloseRequested so a restored
    // run whose earlier close request may have been lost asks again.
    let mut closing: Vec<SessionId> = ctx
        .state
        .checkpoint
        .sessions
        .iter()
        .filter(|(_, s)| {
            matches!(s.status, SessionStatus::Open | SessionStatus::CloseRequested)
        })
        .map(|(id, _)| *id)
        .collect();
    closing.sort();
    for id in &closing {
        if let Some(session) = ctx.state.checkpoint.sessions.get_mut(id) {
            session.status = SessionStatus::CloseRequested;
        }
    }
    // The result doubles as the continuation: a restored run re-enters the
    // close wait from the checkpoint alone, without respawning flow logic.
    ctx.state.checkpoint.continuation = result.clone();
    ctx.state.checkpoint.pending_io_request = Some(IoRequest::WaitForSessionConfirmations);
    ctx.persist_current();
    ctx.commit();
    for id in closing {
        ctx.send_on_session(id, SessionMessage::Close);
    }
    ctx.state.pending_finish = Some(result);
    Ok(ctx.park())
}

fn enter_sub_flow(
    mut ctx: TransitionContext,
    flow_name: &str,
    is_idempotent: bool,
    is_timed: bool,
) -> Result<TransitionResult> {
    // A retry must restart at an idempotent boundary, not inside it, and a
    // timed flow needs a durable checkpoint to be re-triggered from.
    let force_checkpoint =
        (is_idempotent && !ctx.state.checkpoint.contains_idempotent()) || is_timed;
    ctx.state.checkpoint.sub_flow_stack.push(SubFlowEntry {
        flow_name: flow_name.to_string(),
        is_idempotent,
    });
    if force_checkpoint {
        ctx.persist_current();
    }
    ctx.commit();
    Ok(ctx.resume(Vec::new()))
}

fn leave_sub_flow(mut ctx: TransitionContext) -> Result<TransitionResult> {
    if ctx.state.checkpoint.sub_flow_stack.pop().is_none() {
        return Err(EngineError::contract(
            "leave_sub_flow",
            "sub-flow stack underflow",
        ));
    }
    ctx.commit();
    Ok(ctx.resume(Vec::new()))
}

fn initiate_flow(
    mut ctx: TransitionContext,
    destination: &str,
    responder_flow: &str,
    session_id: SessionId,
) -> Result<TransitionResult> {
    ctx.state
        .checkpoint
        .sessions
        .insert(session_id, SessionState::new(destination));
    ctx.commit();
    ctx.send_on_session(
        session_id,
        SessionMessage::Init {
            responder_flow: responder_flow.to_string(),
        },
    );
    let value = serde_json::to_vec(&session_id)?;
    Ok(ctx.resume(value))
}

fn deliver_session_message(
    mut ctx: TransitionContext,
    session_id: SessionId,
    peer_session: SessionId,
    message: SessionMessage,
) -> Result<TransitionResult> {
    let Some(session) = ctx.state.checkpoint.sessions.get_mut(&session_id) else {
        // Late delivery for a session this flow no longer tracks.
        ctx.commit();
        return Ok(ctx.process_events());
    };
    if session.peer_session.is_none() {
        session.peer_session = Some(peer_session);
    }
    match message {
        SessionMessage::Init { .. } => {
            // Opens are handled by the router; one reaching an existing
            // session is a redundant delivery.
            ctx.commit();
            Ok(ctx.process_events())
        }
        SessionMessage::Data { payload } => deliver_data(ctx, session_id, payload),
        SessionMessage::Close => deliver_close(ctx, session_id),
        SessionMessage::CloseAck => deliver_close_ack(ctx, session_id),
        SessionMessage::ErrorEnd { error } => deliver_error_end(ctx, session_id, error),
    }
}

fn deliver_data(
    mut ctx: TransitionContext,
    session_id: SessionId,
    payload: Vec<u8>,
) -> Result<TransitionResult> {
    if let Some(session) = ctx.state.checkpoint.sessions.get_mut(&session_id) {
        session.buffered.push_back(BufferedItem::Data(payload));
    }
    // Persist with the item still buffered: the delivery becomes durable in
    // the same commit that consumes it, so a crash replays it from the
    // checkpoint instead of losing it.
    ctx.persist_current();
    if parked_on_receive(&ctx, session_id) {
        let delivered = ctx
            .state
            .checkpoint
            .sessions
            .get_mut(&session_id)
            .and_then(|s| s.buffered.pop_front());
        match delivered {
            Some(BufferedItem::Data(p)) => {
                resume_waiter(&mut ctx);
                ctx.commit();
                return Ok(ctx.resume(p));
            }
            Some(BufferedItem::ErrorEnd(_)) => {
                resume_waiter(&mut ctx);
                ctx.commit();
                return Ok(ctx.throw(FlowError::UnexpectedSessionEnd { session_id }));
            }
            None => {}
        }
    }
    ctx.commit();
    Ok(ctx.process_events())
}

fn deliver_close(mut ctx: TransitionContext, session_id: SessionId) -> Result<TransitionResult> {
    if let Some(session) = ctx.state.checkpoint.sessions.get_mut(&session_id) {
        session.status = SessionStatus::Closed;
    }
    if all_sessions_terminal(&ctx.state.checkpoint) {
        if let Some(result) = ctx.state.pending_finish.take() {
            finish_actions(&mut ctx);
            ctx.send_on_session(session_id, SessionMessage::CloseAck);
            return Ok(ctx.resume(result));
        }
    }
    ctx.persist_current();
    ctx.commit();
    ctx.send_on_session(session_id, SessionMessage::CloseAck);
    Ok(ctx.process_events())
}

fn deliver_close_ack(mut ctx: TransitionContext, session_id: SessionId) -> Result<TransitionResult> {
    if let Some(session) = ctx.state.checkpoint.sessions.get_mut(&session_id) {
        session.status = SessionStatus::Closed;
    }
    if all_sessions_terminal(&ctx.state.checkpoint) {
        if let Some(result) = ctx.state.pending_finish.take() {
            finish_actions(&mut ctx);
            return Ok(ctx.resume(result));
        }
    }
    ctx.persist_current();
    ctx.commit();
    Ok(ctx.process_events())
}

fn deliver_error_end(
    mut ctx: TransitionContext,
    session_id: SessionId,
    error: FlowError,
) -> Result<TransitionResult> {
    if let Some(session) = ctx.state.checkpoint.sessions.get_mut(&session_id) {
        session.status = SessionStatus::Errored;
    }
    if parked_on_receive(&ctx, session_id) {
        resume_waiter(&mut ctx);
        ctx.persist_current();
        ctx.commit();
        return Ok(ctx.throw(FlowError::UnexpectedSessionEnd { session_id }));
    }
    if all_sessions_terminal(&ctx.state.checkpoint) {
        if let Some(result) = ctx.state.pending_finish.take() {
            // The flow already produced its result; a counterparty failing
            // during the close handshake does not unfinish it.
            finish_actions(&mut ctx);
            return Ok(ctx.resume(result));
        }
    }
    if ctx.state.pending_finish.is_some() {
        // Still waiting on other counterparties to confirm close.
        ctx.persist_current();
        ctx.commit();
        return Ok(ctx.process_events());
    }
    if let Some(session) = ctx.state.checkpoint.sessions.get_mut(&session_id) {
        session.buffered.push_back(BufferedItem::ErrorEnd(error));
    }
    ctx.persist_current();
    ctx.commit();
    Ok(ctx.process_events())
}

fn async_completion(mut ctx: TransitionContext, result: Vec<u8>) -> Result<TransitionResult> {
    let parked = !ctx.state.is_flow_resumed
        && matches!(
            &ctx.state.checkpoint.pending_io_request,
            Some(IoRequest::ExecuteAsyncOperation { .. })
        );
    ctx.commit();
    if parked {
        resume_waiter(&mut ctx);
        Ok(ctx.resume(result))
    } else {
        Ok(ctx.process_events())
    }
}

fn async_throws(mut ctx: TransitionContext, error: FlowError) -> Result<TransitionResult> {
    let parked = !ctx.state.is_flow_resumed
        && matches!(
            &ctx.state.checkpoint.pending_io_request,
            Some(IoRequest::ExecuteAsyncOperation { .. })
        );
    ctx.commit();
    if parked {
        resume_waiter(&mut ctx);
        Ok(ctx.throw(error))
    } else {
        Ok(ctx.process_events())
    }
}

fn wake_up(mut ctx: TransitionContext) -> Result<TransitionResult> {
    let parked = !ctx.state.is_flow_resumed
        && matches!(
            &ctx.state.checkpoint.pending_io_request,
            Some(IoRequest::Sleep { .. })
        );
    ctx.commit();
    if parked {
        resume_waiter(&mut ctx);
        Ok(ctx.resume(Vec::new()))
    } else {
        Ok(ctx.process_events())
    }
}

fn pause(mut ctx: TransitionContext) -> Result<TransitionResult> {
    ctx.state.checkpoint.status = FlowStatus::Paused;
    ctx.action(Action::UpdateFlowStatus {
        status: FlowStatus::Paused,
    });
    Ok(ctx.abort_committed())
}

#[cfg(test)]
mod tests {
    use super::super::transition;
    use crate::events::{Action, Event, FlowContinuation};
    use crate::session::{BufferedItem, SessionMessage, SessionState, SessionStatus};
    use crate::state::{Checkpoint, FlowStatus, IoRequest, SessionId, StateMachineState};

    fn fresh_state() -> StateMachineState {
        StateMachineState::fresh(Checkpoint::initial("trade", false, "alice"), false)
    }

    fn state_with_session() -> (StateMachineState, SessionId) {
        let mut state = fresh_state();
        let session_id = SessionId::new();
        state
            .checkpoint
            .sessions
            .insert(session_id, SessionState::new("bob"));
        (state, session_id)
    }

    fn suspend_on(io_request: IoRequest) -> Event {
        Event::Suspend {
            io_request,
            checkpoint_bytes: vec![9, 9],
            may_skip_checkpoint: false,
        }
    }

    fn has_persist(actions: &[Action]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, Action::PersistCheckpoint { .. }))
    }

    #[test]
    fn test_receive_suspend_persists_and_parks() {
        let (state, session_id) = state_with_session();
        let out = transition(&suspend_on(IoRequest::Receive { session_id }), &state).unwrap();

        assert!(has_persist(&out.actions));
        assert!(out.actions.contains(&Action::CommitTransaction));
        assert_eq!(out.continuation, FlowContinuation::ProcessEvents);
        assert!(!out.state.is_flow_resumed);
        assert!(out.state.is_any_checkpoint_persisted);
        assert_eq!(out.state.checkpoint.suspend_ordinal, 1);
        assert_eq!(
            out.state.checkpoint.pending_io_request,
            Some(IoRequest::Receive { session_id })
        );
    }

    #[test]
    fn test_checkpoint_elided_inside_idempotent_boundary() {
        let (mut state, session_id) = state_with_session();
        state.checkpoint.flow_is_idempotent = true;

        // The first suspend of an idempotent flow still persists.
        let first = transition(&suspend_on(IoRequest::Receive { session_id }), &state).unwrap();
        assert!(has_persist(&first.actions));

        // Later suspends are elided while inside the idempotent boundary.
        let mut resumed = first.state.clone();
        resumed.is_flow_resumed = true;
        resumed.checkpoint.pending_io_request = None;
        let second = transition(&suspend_on(IoRequest::ForceCheckpoint), &resumed).unwrap();
        assert!(!has_persist(&second.actions));
        assert_eq!(second.state.checkpoint.suspend_ordinal, 1);
    }

    #[test]
    fn test_buffered_data_completes_receive_without_parking() {
        let (mut state, session_id) = state_with_session();
        state
            .checkpoint
            .sessions
            .get_mut(&session_id)
            .unwrap()
            .buffered
            .push_back(BufferedItem::Data(vec![5]));

        let out = transition(&suspend_on(IoRequest::Receive { session_id }), &state).unwrap();
        assert_eq!(out.continuation, FlowContinuation::Resume { value: vec![5] });
        assert!(out.state.is_flow_resumed);
        assert!(out.state.checkpoint.pending_io_request.is_none());

        // The persisted snapshot still holds the item so a crash after the
        // commit replays its delivery.
        let snapshot = out
            .actions
            .iter()
            .find_map(|a| match a {
                Action::PersistCheckpoint { checkpoint } => Some(checkpoint),
                _ => None,
            })
            .unwrap();
        assert_eq!(snapshot.sessions[&session_id].buffered.len(), 1);
    }

    #[test]
    fn test_send_commits_without_checkpoint() {
        let (state, session_id) = state_with_session();
        let event = Event::Suspend {
            io_request: IoRequest::Send {
                session_id,
                payload: vec![1, 2],
            },
            checkpoint_bytes: Vec::new(),
            may_skip_checkpoint: true,
        };

        let out = transition(&event, &state).unwrap();
        assert!(!has_persist(&out.actions));
        assert_eq!(out.actions[0], Action::CommitTransaction);
        assert!(matches!(
            &out.actions[1],
            Action::SendSessionMessage { seq: 0, .. }
        ));
        assert_eq!(
            out.continuation,
            FlowContinuation::Resume { value: Vec::new() }
        );
        assert_eq!(out.state.checkpoint.sessions[&session_id].next_send_seq, 1);
        assert_eq!(out.state.checkpoint.suspend_ordinal, 0);
    }

    #[test]
    fn test_send_on_errored_session_throws() {
        let (mut state, session_id) = state_with_session();
        state.checkpoint.sessions.get_mut(&session_id).unwrap().status = SessionStatus::Errored;
        let event = Event::Suspend {
            io_request: IoRequest::Send {
                session_id,
                payload: vec![1],
            },
            checkpoint_bytes: Vec::new(),
            may_skip_checkpoint: true,
        };

        let out = transition(&event, &state).unwrap();
        assert!(matches!(out.continuation, FlowContinuation::Throw { .. }));
    }

    #[test]
    fn test_force_checkpoint_resumes_immediately() {
        let state = fresh_state();
        let out = transition(&suspend_on(IoRequest::ForceCheckpoint), &state).unwrap();

        assert!(has_persist(&out.actions));
        assert_eq!(
            out.continuation,
            FlowContinuation::Resume { value: Vec::new() }
        );
        assert!(out.state.checkpoint.pending_io_request.is_none());
        assert!(out.state.is_flow_resumed);
    }

    #[test]
    fn test_sleep_schedules_wakeup_and_wakeup_resumes() {
        let state = fresh_state();
        let out = transition(&suspend_on(IoRequest::Sleep { duration_ms: 250 }), &state).unwrap();
        assert!(out.actions.iter().any(|a| matches!(
            a,
            Action::ScheduleEvent { delay_ms: 250, event } if **event == Event::WakeUp
        )));
        assert_eq!(out.continuation, FlowContinuation::ProcessEvents);

        let woken = transition(&Event::WakeUp, &out.state).unwrap();
        assert_eq!(
            woken.continuation,
            FlowContinuation::Resume { value: Vec::new() }
        );
        assert!(woken.state.checkpoint.pending_io_request.is_none());
    }

    #[test]
    fn test_finish_without_sessions_removes_flow() {
        let state = fresh_state();
        let out = transition(&Event::FlowFinish { result: vec![42] }, &state).unwrap();

        assert_eq!(out.continuation, FlowContinuation::Resume { value: vec![42] });
        assert!(out.actions.contains(&Action::RemoveCheckpoint));
        assert!(out.actions.contains(&Action::ReleaseSoftLocks));
        assert!(out.actions.contains(&Action::RemoveFlow));
        assert!(out.state.is_removed);
        assert_eq!(out.state.checkpoint.status, FlowStatus::Completed);
    }

    #[test]
    fn test_finish_with_open_session_waits_for_close_ack() {
        let (state, session_id) = state_with_session();
        let out = transition(&Event::FlowFinish { result: vec![7] }, &state).unwrap();

        assert_eq!(out.continuation, FlowContinuation::ProcessEvents);
        assert!(out.actions.iter().any(|a| matches!(
            a,
            Action::SendSessionMessage {
                message: SessionMessage::Close,
                ..
            }
        )));
        assert_eq!(
            out.state.checkpoint.sessions[&session_id].status,
            SessionStatus::CloseRequested
        );
        assert_eq!(out.state.pending_finish, Some(vec![7]));
        assert!(!out.state.is_removed);

        // The counterparty's confirmation completes the finish.
        let ack = Event::DeliverSessionMessage {
            session_id,
            peer_session: SessionId::new(),
            message: SessionMessage::CloseAck,
        };
        let done = transition(&ack, &out.state).unwrap();
        assert_eq!(done.continuation, FlowContinuation::Resume { value: vec![7] });
        assert!(done.state.is_removed);
        assert_eq!(done.state.checkpoint.status, FlowStatus::Completed);
    }

    #[test]
    fn test_data_delivery_resumes_parked_receive() {
        let (mut state, session_id) = state_with_session();
        state.checkpoint.pending_io_request = Some(IoRequest::Receive { session_id });
        state.is_flow_resumed = false;

        let event = Event::DeliverSessionMessage {
            session_id,
            peer_session: SessionId::new(),
            message: SessionMessage::Data { payload: vec![3] },
        };
        let out = transition(&event, &state).unwrap();
        assert_eq!(out.continuation, FlowContinuation::Resume { value: vec![3] });
        assert!(out.state.checkpoint.pending_io_request.is_none());
        assert!(has_persist(&out.actions));
    }

    #[test]
    fn test_data_delivery_buffers_while_flow_is_running() {
        let (state, session_id) = state_with_session();
        let event = Event::DeliverSessionMessage {
            session_id,
            peer_session: SessionId::new(),
            message: SessionMessage::Data { payload: vec![4] },
        };

        let out = transition(&event, &state).unwrap();
        assert_eq!(out.continuation, FlowContinuation::ProcessEvents);
        assert_eq!(
            out.state.checkpoint.sessions[&session_id].buffered.len(),
            1
        );
        assert!(has_persist(&out.actions));
    }

    #[test]
    fn test_error_end_while_parked_throws_unexpected_session_end() {
        let (mut state, session_id) = state_with_session();
        state.checkpoint.pending_io_request = Some(IoRequest::Receive { session_id });
        state.is_flow_resumed = false;

        let event = Event::DeliverSessionMessage {
            session_id,
            peer_session: SessionId::new(),
            message: SessionMessage::ErrorEnd {
                error: crate::error::FlowError::Business("peer died".into()),
            },
        };
        let out = transition(&event, &state).unwrap();
        assert!(matches!(
            out.continuation,
            FlowContinuation::Throw {
                error: crate::error::FlowError::UnexpectedSessionEnd { .. }
            }
        ));
        assert_eq!(
            out.state.checkpoint.sessions[&session_id].status,
            SessionStatus::Errored
        );
    }

    #[test]
    fn test_enter_idempotent_sub_flow_forces_checkpoint_once() {
        let state = fresh_state();
        let enter = Event::EnterSubFlow {
            flow_name: "notarize".into(),
            is_idempotent: true,
            is_timed: false,
        };
        let out = transition(&enter, &state).unwrap();
        assert!(has_persist(&out.actions));
        assert_eq!(out.state.checkpoint.sub_flow_stack.len(), 1);

        // A nested idempotent entry is already inside the boundary.
        let nested = Event::EnterSubFlow {
            flow_name: "verify".into(),
            is_idempotent: true,
            is_timed: false,
        };
        let inner = transition(&nested, &out.state).unwrap();
        assert!(!has_persist(&inner.actions));
        assert_eq!(inner.state.checkpoint.sub_flow_stack.len(), 2);
    }

    #[test]
    fn test_leave_sub_flow_pops_and_underflow_is_rejected() {
        let mut state = fresh_state();
        state.checkpoint.sub_flow_stack.push(crate::state::SubFlowEntry {
            flow_name: "notarize".into(),
            is_idempotent: false,
        });

        let out = transition(&Event::LeaveSubFlow, &state).unwrap();
        assert!(out.state.checkpoint.sub_flow_stack.is_empty());
        assert_eq!(
            out.continuation,
            FlowContinuation::Resume { value: Vec::new() }
        );

        assert!(transition(&Event::LeaveSubFlow, &out.state).is_err());
    }

    #[test]
    fn test_rearm_matches_pending_wait_without_new_checkpoint() {
        let (mut state, session_id) = state_with_session();
        state.checkpoint.pending_io_request = Some(IoRequest::Receive { session_id });
        state.checkpoint.suspend_ordinal = 3;
        state.is_flow_resumed = false;

        let out = transition(&suspend_on(IoRequest::Receive { session_id }), &state).unwrap();
        assert!(!has_persist(&out.actions));
        assert_eq!(out.continuation, FlowContinuation::ProcessEvents);
        assert_eq!(out.state.checkpoint.suspend_ordinal, 3);
    }

    #[test]
    fn test_rearm_divergence_is_contract_violation() {
        let (mut state, session_id) = state_with_session();
        state.checkpoint.pending_io_request = Some(IoRequest::Sleep { duration_ms: 100 });
        state.is_flow_resumed = false;

        let result = transition(&suspend_on(IoRequest::Receive { session_id }), &state);
        assert!(result.is_err());
    }

    #[test]
    fn test_events_after_kill_abort_the_fiber() {
        let (mut state, session_id) = state_with_session();
        state.is_killed = true;

        let out = transition(&suspend_on(IoRequest::Receive { session_id }), &state).unwrap();
        assert_eq!(out.continuation, FlowContinuation::Abort);
        assert_eq!(out.actions, vec![Action::RollbackTransaction]);
    }

    #[test]
    fn test_pause_retains_checkpoint_and_releases_fiber() {
        let state = fresh_state();
        let out = transition(&Event::Pause, &state).unwrap();

        assert_eq!(out.continuation, FlowContinuation::Abort);
        assert_eq!(
            out.actions,
            vec![
                Action::UpdateFlowStatus {
                    status: FlowStatus::Paused
                },
                Action::CommitTransaction,
            ]
        );
        assert_eq!(out.state.checkpoint.status, FlowStatus::Paused);
        assert!(!out.state.is_removed);
    }

    #[test]
    fn test_initiate_flow_opens_session_and_sends_init() {
        let state = fresh_state();
        let session_id = SessionId::new();
        let event = Event::InitiateFlow {
            destination: "bob".into(),
            responder_flow: "trade-responder".into(),
            session_id,
        };

        let out = transition(&event, &state).unwrap();
        assert!(out.state.checkpoint.sessions.contains_key(&session_id));
        assert!(out.actions.iter().any(|a| matches!(
            a,
            Action::SendSessionMessage {
                message: SessionMessage::Init { .. },
                seq: 0,
                ..
            }
        )));
        assert_eq!(
            out.continuation,
            FlowContinuation::Resume {
                value: serde_json::to_vec(&session_id).unwrap()
            }
        );
    }

    #[test]
    fn test_async_completion_resumes_parked_operation() {
        let mut state = fresh_state();
        state.checkpoint.pending_io_request = Some(IoRequest::ExecuteAsyncOperation {
            dedup_id: "run:1".into(),
        });
        state.is_flow_resumed = false;

        let out = transition(&Event::AsyncOperationCompletion { result: vec![8] }, &state).unwrap();
        assert_eq!(out.continuation, FlowContinuation::Resume { value: vec![8] });

        // A completion arriving while the flow runs elsewhere is stale.
        let stale = transition(
            &Event::AsyncOperationCompletion { result: vec![8] },
            &fresh_state(),
        )
        .unwrap();
        assert_eq!(stale.continuation, FlowContinuation::ProcessEvents);
    }
}
