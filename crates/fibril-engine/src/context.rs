// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The flow-facing API: the [`Flow`] trait and the [`FlowContext`] handed to
//! running flow logic.
//!
//! Flows are written against explicit state: every suspending operation
//! takes the flow's current state object, which becomes the checkpointed
//! continuation. After a crash or retry the flow's `call` runs again from
//! the top with [`FlowContext::restored_state`] returning the last
//! checkpointed state, and the flow skips work it already completed.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::FlowError;
use crate::state::{FlowRunId, IoRequest, SessionId};

/// A unit of flow logic.
///
/// `call` must be deterministic given the context: after a restore it runs
/// again from the top, and any divergence from the checkpointed suspend
/// point poisons the fiber. Side effects belong behind
/// [`FlowContext::execute_async`] or session messages, never in plain code.
#[async_trait]
pub trait Flow: Send + Sync {
    /// Run the flow to completion, returning its serialized result.
    async fn call(&self, ctx: &mut FlowContext) -> std::result::Result<Vec<u8>, FlowError>;
}

pub(crate) type AsyncOperationFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Vec<u8>, FlowError>> + Send>>;

/// An external operation started by `execute_async`. Receives the stable
/// deduplication id the engine derived for this suspend.
pub(crate) type AsyncOperation = Box<dyn FnOnce(String) -> AsyncOperationFuture + Send>;

pub(crate) type SuspendReply = oneshot::Sender<std::result::Result<Vec<u8>, FlowError>>;

/// Requests flow logic sends to its fiber.
pub(crate) enum FiberRequest {
    /// A suspending operation.
    Suspend {
        io_request: IoRequest,
        state_bytes: Vec<u8>,
        may_skip_checkpoint: bool,
        async_op: Option<AsyncOperation>,
        reply: SuspendReply,
    },
    /// Open a session to a counterparty.
    InitiateFlow {
        destination: String,
        responder_flow: String,
        session_id: SessionId,
        reply: SuspendReply,
    },
    /// Push a sub-flow frame.
    EnterSubFlow {
        flow_name: String,
        is_idempotent: bool,
        is_timed: bool,
        reply: SuspendReply,
    },
    /// Pop the innermost sub-flow frame.
    LeaveSubFlow { reply: SuspendReply },
    /// Record a progress step for observability.
    Progress { step: String, reply: SuspendReply },
    /// Record a soft-locked resource reference.
    SoftLock { reference: Uuid, reply: SuspendReply },
    /// Flow logic returned.
    Completed {
        result: std::result::Result<Vec<u8>, FlowError>,
    },
}

/// Handle through which flow logic talks to its fiber.
pub struct FlowContext {
    run_id: FlowRunId,
    requests: mpsc::UnboundedSender<FiberRequest>,
    restored: Option<Vec<u8>>,
    initiated_by: Option<SessionId>,
}

impl FlowContext {
    pub(crate) fn new(
        run_id: FlowRunId,
        requests: mpsc::UnboundedSender<FiberRequest>,
        restored: Option<Vec<u8>>,
        initiated_by: Option<SessionId>,
    ) -> Self {
        Self {
            run_id,
            requests,
            restored,
            initiated_by,
        }
    }

    /// This flow instance's run id.
    pub fn run_id(&self) -> FlowRunId {
        self.run_id
    }

    /// For responder flows: the session opened by the initiating
    /// counterparty. `None` for flows started directly.
    pub fn initiated_by(&self) -> Option<SessionId> {
        self.initiated_by
    }

    /// The state checkpointed at the last suspend, if this logic run is a
    /// replay. `None` on the first run.
    pub fn restored_state<S: DeserializeOwned>(
        &self,
    ) -> std::result::Result<Option<S>, FlowError> {
        match &self.restored {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| state_round_trip::<S>(e.to_string())),
        }
    }

    /// Wait for the next message on a session. Suspends and checkpoints.
    pub async fn receive<S: Serialize>(
        &mut self,
        state: &S,
        session_id: SessionId,
    ) -> std::result::Result<Vec<u8>, FlowError> {
        self.suspend(
            IoRequest::Receive { session_id },
            encode_state(state)?,
            false,
            None,
        )
        .await
    }

    /// Send a payload on a session. Completes in the same step and does not
    /// write a checkpoint.
    pub async fn send<S: Serialize>(
        &mut self,
        state: &S,
        session_id: SessionId,
        payload: Vec<u8>,
    ) -> std::result::Result<(), FlowError> {
        self.suspend(
            IoRequest::Send {
                session_id,
                payload,
            },
            encode_state(state)?,
            true,
            None,
        )
        .await
        .map(|_| ())
    }

    /// Run an external operation outside the fiber, suspending until it
    /// completes.
    ///
    /// The operation receives a deduplication id that stays stable across
    /// retries of the same suspend, so the external system can recognize a
    /// re-issued call.
    pub async fn execute_async<S, F, Fut>(
        &mut self,
        state: &S,
        operation: F,
    ) -> std::result::Result<Vec<u8>, FlowError>
    where
        S: Serialize,
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Vec<u8>, FlowError>> + Send + 'static,
    {
        let op: AsyncOperation = Box::new(move |dedup_id| Box::pin(operation(dedup_id)));
        self.suspend(
            IoRequest::ExecuteAsyncOperation {
                dedup_id: String::new(),
            },
            encode_state(state)?,
            false,
            Some(op),
        )
        .await
    }

    /// Durable sleep. Survives restarts; the remaining delay restarts in
    /// full on replay.
    pub async fn sleep<S: Serialize>(
        &mut self,
        state: &S,
        duration: std::time::Duration,
    ) -> std::result::Result<(), FlowError> {
        self.suspend(
            IoRequest::Sleep {
                duration_ms: duration.as_millis() as u64,
            },
            encode_state(state)?,
            false,
            None,
        )
        .await
        .map(|_| ())
    }

    /// Force a checkpoint of the given state without any external wait.
    pub async fn checkpoint<S: Serialize>(
        &mut self,
        state: &S,
    ) -> std::result::Result<(), FlowError> {
        self.suspend(IoRequest::ForceCheckpoint, encode_state(state)?, false, None)
            .await
            .map(|_| ())
    }

    /// Open a session to `destination`, asking it to start `responder_flow`.
    pub async fn initiate_flow(
        &mut self,
        destination: &str,
        responder_flow: &str,
    ) -> std::result::Result<SessionId, FlowError> {
        let session_id = SessionId::new();
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            FiberRequest::InitiateFlow {
                destination: destination.to_string(),
                responder_flow: responder_flow.to_string(),
                session_id,
                reply,
            },
            rx,
        )
        .await?;
        Ok(session_id)
    }

    /// Run `flow` as a nested sub-flow, sharing this fiber.
    ///
    /// Entering an idempotent sub-flow from a non-idempotent flow forces a
    /// checkpoint first; inside it, incremental checkpoints are elided.
    /// Timed sub-flows also checkpoint on entry so a retry restarts them
    /// cleanly.
    pub async fn sub_flow(
        &mut self,
        name: &str,
        is_idempotent: bool,
        is_timed: bool,
        flow: &dyn Flow,
    ) -> std::result::Result<Vec<u8>, FlowError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            FiberRequest::EnterSubFlow {
                flow_name: name.to_string(),
                is_idempotent,
                is_timed,
                reply,
            },
            rx,
        )
        .await?;
        let result = flow.call(self).await;
        let (reply, rx) = oneshot::channel();
        self.dispatch(FiberRequest::LeaveSubFlow { reply }, rx).await?;
        result
    }

    /// Report the current progress step, shown on the operator surface.
    pub async fn progress(&mut self, step: &str) -> std::result::Result<(), FlowError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            FiberRequest::Progress {
                step: step.to_string(),
                reply,
            },
            rx,
        )
        .await
        .map(|_| ())
    }

    /// Record a soft lock on a resource reference. Released on any
    /// finalization path, including abnormal termination.
    pub async fn soft_lock(&mut self, reference: Uuid) -> std::result::Result<(), FlowError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(FiberRequest::SoftLock { reference, reply }, rx)
            .await
            .map(|_| ())
    }

    async fn suspend(
        &mut self,
        io_request: IoRequest,
        state_bytes: Vec<u8>,
        may_skip_checkpoint: bool,
        async_op: Option<AsyncOperation>,
    ) -> std::result::Result<Vec<u8>, FlowError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            FiberRequest::Suspend {
                io_request,
                state_bytes,
                may_skip_checkpoint,
                async_op,
                reply,
            },
            rx,
        )
        .await
    }

    /// Send a request and await the fiber's reply.
    ///
    /// A closed channel means the fiber aborted this logic run (kill,
    /// pause, reload); the task is about to be dropped, so park forever
    /// rather than surface a spurious error into flow code.
    async fn dispatch(
        &mut self,
        request: FiberRequest,
        rx: oneshot::Receiver<std::result::Result<Vec<u8>, FlowError>>,
    ) -> std::result::Result<Vec<u8>, FlowError> {
        if self.requests.send(request).is_err() {
            return std::future::pending().await;
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => std::future::pending().await,
        }
    }
}

fn encode_state<S: Serialize>(state: &S) -> std::result::Result<Vec<u8>, FlowError> {
    serde_json::to_vec(state).map_err(|e| state_round_trip::<S>(e.to_string()))
}

fn state_round_trip<S>(reason: String) -> FlowError {
    FlowError::StateRoundTrip {
        type_name: std::any::type_name::<S>().to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TradeState {
        step: u32,
        counterparty: String,
    }

    fn context(restored: Option<Vec<u8>>) -> (FlowContext, mpsc::UnboundedReceiver<FiberRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FlowContext::new(FlowRunId::new(), tx, restored, None), rx)
    }

    #[test]
    fn test_restored_state_absent_on_first_run() {
        let (ctx, _rx) = context(None);
        let state: Option<TradeState> = ctx.restored_state().unwrap();
        assert!(state.is_none());
    }

    #[test]
    fn test_restored_state_round_trips() {
        let original = TradeState {
            step: 3,
            counterparty: "bob".into(),
        };
        let bytes = serde_json::to_vec(&original).unwrap();
        let (ctx, _rx) = context(Some(bytes));
        let state: TradeState = ctx.restored_state().unwrap().unwrap();
        assert_eq!(state, original);
    }

    #[test]
    fn test_restored_state_mismatch_names_the_type() {
        let (ctx, _rx) = context(Some(b"not json".to_vec()));
        let err = ctx.restored_state::<TradeState>().unwrap_err();
        match err {
            FlowError::StateRoundTrip { type_name, .. } => {
                assert!(type_name.contains("TradeState"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_emits_suspend_request_with_state_bytes() {
        let (mut ctx, mut rx) = context(None);
        let session_id = SessionId::new();
        let state = TradeState {
            step: 1,
            counterparty: "bob".into(),
        };

        let receive = tokio::spawn(async move { ctx.receive(&state, session_id).await });
        let request = rx.recv().await.unwrap();
        match request {
            FiberRequest::Suspend {
                io_request,
                state_bytes,
                may_skip_checkpoint,
                reply,
                ..
            } => {
                assert_eq!(io_request, IoRequest::Receive { session_id });
                assert!(!may_skip_checkpoint);
                let decoded: TradeState = serde_json::from_slice(&state_bytes).unwrap();
                assert_eq!(decoded.step, 1);
                reply.send(Ok(vec![42])).unwrap();
            }
            _ => panic!("expected suspend request"),
        }
        assert_eq!(receive.await.unwrap().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_send_skips_checkpoint() {
        let (mut ctx, mut rx) = context(None);
        let session_id = SessionId::new();

        let send = tokio::spawn(async move {
            ctx.send(&serde_json::json!({}), session_id, vec![7]).await
        });
        match rx.recv().await.unwrap() {
            FiberRequest::Suspend {
                io_request,
                may_skip_checkpoint,
                reply,
                ..
            } => {
                assert!(may_skip_checkpoint);
                assert!(matches!(io_request, IoRequest::Send { .. }));
                reply.send(Ok(Vec::new())).unwrap();
            }
            _ => panic!("expected suspend request"),
        }
        send.await.unwrap().unwrap();
    }
}
