// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The fiber: one cooperatively-suspending execution unit per flow run.
//!
//! A fiber owns the run's event queue and processes events strictly one at
//! a time. Flow logic runs in a separate task and talks to its fiber over a
//! request channel; a parked flow holds no thread, only a oneshot reply
//! slot. Respawns re-create the logic task from the committed checkpoint
//! and let it replay to its suspend point, where the re-issued request is
//! matched against the pending one instead of producing a new checkpoint.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::{AsyncOperation, FiberRequest, FlowContext, SuspendReply};
use crate::error::{EngineError, FlowError, Result};
use crate::events::{Event, FlowContinuation};
use crate::executor::TransitionExecutor;
use crate::hospital::FlowHospital;
use crate::registry::FlowFactory;
use crate::runtime::SessionIndex;
use crate::session::SessionTransport;
use crate::state::{FlowRunId, IoRequest, SessionId, StateMachineState};
use crate::store::CheckpointStore;

/// Observer invoked every time flow logic is (re)spawned for a run.
pub type ReloadHook = Arc<dyn Fn(FlowRunId) + Send + Sync>;

/// Everything needed to start a fiber.
pub(crate) struct FiberParams {
    pub(crate) run_id: FlowRunId,
    pub(crate) participant: String,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) transport: Arc<dyn SessionTransport>,
    pub(crate) hospital: Arc<FlowHospital>,
    pub(crate) factory: FlowFactory,
    pub(crate) args: Vec<u8>,
    pub(crate) state: StateMachineState,
    pub(crate) initiated_by: Option<SessionId>,
    pub(crate) reload_after_suspend: bool,
    pub(crate) reload_hook: Option<ReloadHook>,
    pub(crate) sessions: Option<Arc<SessionIndex>>,
    pub(crate) result_tx: oneshot::Sender<Result<Vec<u8>>>,
    pub(crate) on_exit: mpsc::UnboundedSender<FlowRunId>,
}

/// The runtime's handle to a live fiber.
pub(crate) struct FiberHandle {
    pub(crate) events_tx: mpsc::UnboundedSender<Event>,
    pub(crate) task: JoinHandle<()>,
}

/// Start a fiber task for the given run.
pub(crate) fn spawn(params: FiberParams) -> FiberHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let executor = TransitionExecutor::new(
        params.run_id,
        params.participant,
        Arc::clone(&params.store),
        params.transport,
        params.hospital,
        events_tx.clone(),
        params.reload_after_suspend,
    );
    let fiber = Fiber {
        run_id: params.run_id,
        state: params.state,
        executor,
        store: params.store,
        factory: params.factory,
        args: params.args,
        initiated_by: params.initiated_by,
        reload_after_suspend: params.reload_after_suspend,
        reload_hook: params.reload_hook,
        sessions: params.sessions,
        events_tx: events_tx.clone(),
        events_rx,
        requests_tx,
        requests_rx,
        parked_reply: None,
        logic: None,
        result_tx: Some(params.result_tx),
        on_exit: params.on_exit,
    };
    let task = tokio::spawn(fiber.run());
    FiberHandle { events_tx, task }
}

struct Fiber {
    run_id: FlowRunId,
    state: StateMachineState,
    executor: TransitionExecutor,
    store: Arc<dyn CheckpointStore>,
    factory: FlowFactory,
    args: Vec<u8>,
    initiated_by: Option<SessionId>,
    reload_after_suspend: bool,
    reload_hook: Option<ReloadHook>,
    sessions: Option<Arc<SessionIndex>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    requests_tx: mpsc::UnboundedSender<FiberRequest>,
    requests_rx: mpsc::UnboundedReceiver<FiberRequest>,
    parked_reply: Option<SuspendReply>,
    logic: Option<JoinHandle<()>>,
    result_tx: Option<oneshot::Sender<Result<Vec<u8>>>>,
    on_exit: mpsc::UnboundedSender<FlowRunId>,
}

impl Fiber {
    async fn run(mut self) {
        self.spawn_logic();
        loop {
            // Logic requests take priority so a suspend is processed before
            // events that may target it.
            let keep_going = tokio::select! {
                biased;
                Some(request) = self.requests_rx.recv() => self.handle_request(request).await,
                Some(event) = self.events_rx.recv() => self.step(&event).await,
            };
            if !keep_going {
                break;
            }
        }
        if let Some(handle) = self.logic.take() {
            handle.abort();
        }
        let _ = self.on_exit.send(self.run_id);
        debug!(run_id = %self.run_id, "fiber released");
    }

    async fn handle_request(&mut self, request: FiberRequest) -> bool {
        match request {
            FiberRequest::Suspend {
                mut io_request,
                state_bytes,
                may_skip_checkpoint,
                async_op,
                reply,
            } => {
                self.resolve_dedup_id(&mut io_request);
                let event = Event::Suspend {
                    io_request,
                    checkpoint_bytes: state_bytes,
                    may_skip_checkpoint,
                };
                self.step_with_reply(&event, Some(reply), async_op).await
            }
            FiberRequest::InitiateFlow {
                destination,
                responder_flow,
                session_id,
                reply,
            } => {
                let event = Event::InitiateFlow {
                    destination,
                    responder_flow,
                    session_id,
                };
                let keep_going = self.step_with_reply(&event, Some(reply), None).await;
                // Register the new session with the router so replies
                // addressed to it find this fiber.
                if self.state.checkpoint.sessions.contains_key(&session_id) {
                    if let Some(index) = &self.sessions {
                        index.register_local(session_id, self.run_id).await;
                    }
                }
                keep_going
            }
            FiberRequest::EnterSubFlow {
                flow_name,
                is_idempotent,
                is_timed,
                reply,
            } => {
                if !self.state.is_flow_resumed {
                    // Replaying toward the suspend point: the frame is
                    // already in the checkpoint.
                    let _ = reply.send(Ok(Vec::new()));
                    return true;
                }
                let event = Event::EnterSubFlow {
                    flow_name,
                    is_idempotent,
                    is_timed,
                };
                self.step_with_reply(&event, Some(reply), None).await
            }
            FiberRequest::LeaveSubFlow { reply } => {
                if !self.state.is_flow_resumed {
                    let _ = reply.send(Ok(Vec::new()));
                    return true;
                }
                self.step_with_reply(&Event::LeaveSubFlow, Some(reply), None)
                    .await
            }
            FiberRequest::Progress { step, reply } => {
                // Durable at the next persisting suspend.
                self.state.checkpoint.progress_step = Some(step);
                let _ = reply.send(Ok(Vec::new()));
                true
            }
            FiberRequest::SoftLock { reference, reply } => {
                self.state.soft_locked_refs.insert(reference);
                let _ = reply.send(Ok(Vec::new()));
                true
            }
            FiberRequest::Completed { result } => {
                let event = match result {
                    Ok(result) => Event::FlowFinish { result },
                    Err(cause) => Event::Error {
                        cause,
                        was_initialized: self.state.is_any_checkpoint_persisted,
                    },
                };
                self.step(&event).await
            }
        }
    }

    async fn step(&mut self, event: &Event) -> bool {
        self.step_with_reply(event, None, None).await
    }

    async fn step_with_reply(
        &mut self,
        event: &Event,
        reply: Option<SuspendReply>,
        async_op: Option<AsyncOperation>,
    ) -> bool {
        let old_ordinal = self.state.checkpoint.suspend_ordinal;
        let (new_state, outcome) = match self.executor.process_event(event, &self.state).await {
            Ok(step) => step,
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "event-processing step failed, poisoning fiber");
                self.resolve(Err(e));
                return false;
            }
        };
        let persisted = new_state.checkpoint.suspend_ordinal > old_ordinal;
        self.state = new_state;

        if self.reload_after_suspend
            && persisted
            && !outcome.remove_flow
            && matches!(event, Event::Suspend { .. })
        {
            // Verify the committed checkpoint round-trips by discarding the
            // in-memory fiber state and re-deriving everything from it.
            drop(reply);
            return self.reload_from_store().await;
        }

        let mut keep_going = !outcome.remove_flow;
        match outcome.continuation {
            FlowContinuation::Resume { value } => {
                if self.state.is_killed {
                    error!(run_id = %self.run_id, "resume reached a killed fiber, dropping it");
                } else if let Some(r) = reply {
                    let _ = r.send(Ok(value));
                } else if let Some(r) = self.parked_reply.take() {
                    let _ = r.send(Ok(value));
                } else if outcome.remove_flow {
                    self.resolve(Ok(value));
                } else {
                    warn!(run_id = %self.run_id, "resume with no parked suspend");
                }
            }
            FlowContinuation::Throw { error } => {
                if let Some(r) = reply {
                    let _ = r.send(Err(error.clone()));
                } else if let Some(r) = self.parked_reply.take() {
                    let _ = r.send(Err(error.clone()));
                }
                if outcome.remove_flow {
                    self.resolve(Err(EngineError::Flow(error)));
                }
            }
            FlowContinuation::ProcessEvents => {
                if let Some(r) = reply {
                    self.parked_reply = Some(r);
                    if let Some(op) = async_op {
                        self.spawn_async_op(event, op);
                    }
                }
            }
            FlowContinuation::Abort => {
                keep_going = false;
            }
        }

        if let Some(restored) = outcome.respawn_from {
            self.state = restored;
            self.respawn_logic();
        }
        keep_going
    }

    /// Fill in the deduplication id for an async-operation suspend.
    ///
    /// Re-arming a restored wait reuses the id recorded in the checkpoint;
    /// a live suspend derives a fresh one from the run id and the ordinal
    /// this suspend will persist under. Retries therefore keep the id, a
    /// later suspend gets a new one.
    fn resolve_dedup_id(&self, io_request: &mut IoRequest) {
        let IoRequest::ExecuteAsyncOperation { dedup_id } = io_request else {
            return;
        };
        if !self.state.is_flow_resumed {
            if let Some(IoRequest::ExecuteAsyncOperation { dedup_id: pending }) =
                &self.state.checkpoint.pending_io_request
            {
                *dedup_id = pending.clone();
                return;
            }
        }
        *dedup_id = format!(
            "{}:{}",
            self.run_id,
            self.state.checkpoint.suspend_ordinal + 1
        );
    }

    fn spawn_async_op(&self, event: &Event, op: AsyncOperation) {
        let Event::Suspend {
            io_request: IoRequest::ExecuteAsyncOperation { dedup_id },
            ..
        } = event
        else {
            return;
        };
        let future = op(dedup_id.clone());
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match future.await {
                Ok(result) => Event::AsyncOperationCompletion { result },
                Err(error) => Event::AsyncOperationThrows { error },
            };
            let _ = events_tx.send(event);
        });
    }

    async fn reload_from_store(&mut self) -> bool {
        match self.store.read(self.run_id).await {
            Ok(Some(checkpoint)) => {
                self.state = StateMachineState::restored(checkpoint, self.reload_after_suspend);
                self.respawn_logic();
                true
            }
            Ok(None) => {
                self.resolve(Err(EngineError::CheckpointReload {
                    flow_name: self.state.checkpoint.flow_name.clone(),
                    suspend_ordinal: self.state.checkpoint.suspend_ordinal,
                    reason: "checkpoint missing after commit".to_string(),
                }));
                false
            }
            Err(e) => {
                self.resolve(Err(EngineError::CheckpointReload {
                    flow_name: self.state.checkpoint.flow_name.clone(),
                    suspend_ordinal: self.state.checkpoint.suspend_ordinal,
                    reason: e.to_string(),
                }));
                false
            }
        }
    }

    fn respawn_logic(&mut self) {
        if let Some(handle) = self.logic.take() {
            handle.abort();
        }
        self.parked_reply = None;
        self.spawn_logic();
    }

    fn spawn_logic(&mut self) {
        if let Some(hook) = &self.reload_hook {
            hook(self.run_id);
        }
        if !self.state.is_flow_resumed
            && matches!(
                self.state.checkpoint.pending_io_request,
                Some(IoRequest::WaitForSessionConfirmations)
            )
        {
            // The flow already finished; its result is the checkpointed
            // continuation. Re-enter the close wait instead of replaying
            // flow logic.
            let _ = self.events_tx.send(Event::FlowFinish {
                result: self.state.checkpoint.continuation.clone(),
            });
            return;
        }
        let flow = match (self.factory)(self.args.clone()) {
            Ok(flow) => flow,
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "flow factory failed");
                let _ = self.events_tx.send(Event::Error {
                    cause: FlowError::Business(format!("flow could not be constructed: {}", e)),
                    was_initialized: self.state.is_any_checkpoint_persisted,
                });
                return;
            }
        };
        let restored = if self.state.checkpoint.continuation.is_empty() {
            None
        } else {
            Some(self.state.checkpoint.continuation.clone())
        };
        let mut ctx = FlowContext::new(
            self.run_id,
            self.requests_tx.clone(),
            restored,
            self.initiated_by,
        );
        let requests_tx = self.requests_tx.clone();
        self.logic = Some(tokio::spawn(async move {
            let result = flow.call(&mut ctx).await;
            let _ = requests_tx.send(FiberRequest::Completed { result });
        }));
    }

    fn resolve(&mut self, result: Result<Vec<u8>>) {
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(result);
        }
    }
}
