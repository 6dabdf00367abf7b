// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The runtime: one participant's collection of fibers plus the session
//! router that connects them to the outside world.
//!
//! A [`FlowRuntime`] is built once per participant from a
//! [`FlowRuntimeBuilder`], owns the checkpoint store, transport, and
//! hospital, and exposes the operator surface (start, result, retry, kill,
//! pause, wake, recover). Inbound session envelopes are routed to the owning
//! fiber; `Init` envelopes start responder flows.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::Flow;
use crate::error::{EngineError, FlowError, Result};
use crate::events::Event;
use crate::fiber::{self, FiberHandle, FiberParams, ReloadHook};
use crate::hospital::{FlowHospital, MedicalRecord};
use crate::registry::{FlowFactory, FlowRegistry};
use crate::session::{
    DedupTable, LocalTransport, SessionEnvelope, SessionMessage, SessionState, SessionTransport,
};
use crate::state::{Checkpoint, FlowRunId, FlowStatus, SessionId, StateMachineState};
use crate::store::{CheckpointStore, StoredFlow, create_store};

/// Maps live sessions to the fibers that own them.
///
/// Two keys per routable session: the local session id (used when the
/// counterparty already knows it) and the (peer, peer-session) pair (used
/// for messages sent before the counterparty has learned our id).
#[derive(Default)]
pub(crate) struct SessionIndex {
    inner: Mutex<IndexInner>,
}

#[derive(Default)]
struct IndexInner {
    by_local: HashMap<SessionId, FlowRunId>,
    by_peer: HashMap<(String, SessionId), (FlowRunId, SessionId)>,
}

impl SessionIndex {
    /// Make a locally-allocated session id routable to `run_id`.
    pub(crate) async fn register_local(&self, session_id: SessionId, run_id: FlowRunId) {
        let mut inner = self.inner.lock().await;
        inner.by_local.insert(session_id, run_id);
    }

    /// Record the counterparty's session id for an inbound-initiated session.
    async fn link_peer(
        &self,
        peer: &str,
        peer_session: SessionId,
        run_id: FlowRunId,
        local_session: SessionId,
    ) {
        let mut inner = self.inner.lock().await;
        inner
            .by_peer
            .insert((peer.to_string(), peer_session), (run_id, local_session));
    }

    /// Whether an `Init` from this (peer, session) pair was already accepted.
    async fn peer_link_exists(&self, peer: &str, peer_session: SessionId) -> bool {
        let inner = self.inner.lock().await;
        inner
            .by_peer
            .contains_key(&(peer.to_string(), peer_session))
    }

    /// Resolve an envelope to the owning run and local session.
    async fn resolve(&self, envelope: &SessionEnvelope) -> Option<(FlowRunId, SessionId)> {
        let inner = self.inner.lock().await;
        if let Some(local) = envelope.to_session {
            if let Some(run_id) = inner.by_local.get(&local) {
                return Some((*run_id, local));
            }
        }
        inner
            .by_peer
            .get(&(envelope.from_peer.clone(), envelope.from_session))
            .copied()
    }

    /// Drop every entry owned by a finished run.
    async fn forget_run(&self, run_id: FlowRunId) {
        let mut inner = self.inner.lock().await;
        inner.by_local.retain(|_, owner| *owner != run_id);
        inner.by_peer.retain(|_, (owner, _)| *owner != run_id);
    }
}

struct RuntimeInner {
    config: EngineConfig,
    registry: FlowRegistry,
    store: Arc<dyn CheckpointStore>,
    transport: Arc<dyn SessionTransport>,
    hospital: Arc<FlowHospital>,
    reload_hook: Option<ReloadHook>,
    session_index: Arc<SessionIndex>,
    dedup: Mutex<DedupTable>,
    fibers: Mutex<HashMap<FlowRunId, FiberHandle>>,
    results: Mutex<HashMap<FlowRunId, oneshot::Receiver<Result<Vec<u8>>>>>,
    exit_tx: mpsc::UnboundedSender<FlowRunId>,
    shutdown: CancellationToken,
}

impl RuntimeInner {
    async fn fiber_events(&self, run_id: FlowRunId) -> Option<mpsc::UnboundedSender<Event>> {
        self.fibers
            .lock()
            .await
            .get(&run_id)
            .map(|handle| handle.events_tx.clone())
    }

    /// Commit the initial checkpoint row for a new run.
    ///
    /// Written before the fiber exists so that a crash between start and
    /// first suspend leaves a restorable row, and so that errors raised
    /// before the first suspend are triage-eligible.
    async fn persist_initial(&self, run_id: FlowRunId, checkpoint: &Checkpoint) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if let Err(e) = self.store.write(tx.as_mut(), run_id, checkpoint).await {
            let _ = tx.rollback().await;
            return Err(e);
        }
        tx.commit().await
    }

    async fn set_status(&self, run_id: FlowRunId, status: FlowStatus) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if let Err(e) = self.store.update_status(tx.as_mut(), run_id, status).await {
            let _ = tx.rollback().await;
            return Err(e);
        }
        tx.commit().await
    }

    async fn delete_row(&self, run_id: FlowRunId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if let Err(e) = self.store.delete(tx.as_mut(), run_id).await {
            let _ = tx.rollback().await;
            return Err(e);
        }
        tx.commit().await
    }

    /// Spawn a fiber and record its handle and result slot.
    ///
    /// The fibers lock is held across the spawn so the exit reaper cannot
    /// observe the run before its handle is in the table.
    async fn spawn_fiber(
        self: &Arc<Self>,
        run_id: FlowRunId,
        factory: FlowFactory,
        args: Vec<u8>,
        state: StateMachineState,
        initiated_by: Option<SessionId>,
    ) {
        let (result_tx, result_rx) = oneshot::channel();
        let mut fibers = self.fibers.lock().await;
        let handle = fiber::spawn(FiberParams {
            run_id,
            participant: self.config.participant.clone(),
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            hospital: Arc::clone(&self.hospital),
            factory,
            args,
            state,
            initiated_by,
            reload_after_suspend: self.config.reload_after_suspend,
            reload_hook: self.reload_hook.clone(),
            sessions: Some(Arc::clone(&self.session_index)),
            result_tx,
            on_exit: self.exit_tx.clone(),
        });
        fibers.insert(run_id, handle);
        drop(fibers);
        self.results.lock().await.insert(run_id, result_rx);
    }

    /// Re-derive a fiber from a committed checkpoint and respawn its logic.
    async fn revive(self: &Arc<Self>, run_id: FlowRunId, checkpoint: Checkpoint) -> Result<()> {
        let definition = self.registry.get(&checkpoint.flow_name)?.clone();
        for (session_id, session) in &checkpoint.sessions {
            self.session_index.register_local(*session_id, run_id).await;
            if let Some(peer_session) = session.peer_session {
                self.session_index
                    .link_peer(&session.peer, peer_session, run_id, *session_id)
                    .await;
            }
        }
        let initiated_by = checkpoint.invocation_context.initiated_by;
        let args = checkpoint.start_args.clone();
        let state = StateMachineState::restored(checkpoint, self.config.reload_after_suspend);
        self.spawn_fiber(run_id, definition.factory, args, state, initiated_by)
            .await;
        Ok(())
    }

    async fn route(self: &Arc<Self>, envelope: SessionEnvelope) -> Result<()> {
        if let SessionMessage::Init { responder_flow } = &envelope.message {
            let responder_flow = responder_flow.clone();
            return self.accept_init(&envelope, &responder_flow).await;
        }
        let Some((run_id, session_id)) = self.session_index.resolve(&envelope).await else {
            warn!(
                from = %envelope.from_peer,
                from_session = %envelope.from_session,
                "dropping envelope for an unknown session"
            );
            return Ok(());
        };
        if self.dedup.lock().await.is_duplicate(session_id, &envelope) {
            debug!(
                session_id = %session_id,
                seq = envelope.seq,
                "dropping duplicate session message"
            );
            return Ok(());
        }
        let Some(events) = self.fiber_events(run_id).await else {
            warn!(run_id = %run_id, "dropping session message for a run with no live fiber");
            return Ok(());
        };
        let _ = events.send(Event::DeliverSessionMessage {
            session_id,
            peer_session: envelope.from_session,
            message: envelope.message,
        });
        Ok(())
    }

    /// Start a responder flow for an inbound `Init`.
    ///
    /// The initial checkpoint is committed before the fiber spawns, with the
    /// inbound session pre-installed, so a crash mid-handshake leaves a
    /// restorable responder rather than a dangling initiator.
    async fn accept_init(
        self: &Arc<Self>,
        envelope: &SessionEnvelope,
        responder_flow: &str,
    ) -> Result<()> {
        if self
            .session_index
            .peer_link_exists(&envelope.from_peer, envelope.from_session)
            .await
        {
            debug!(
                from = %envelope.from_peer,
                from_session = %envelope.from_session,
                "ignoring redelivered session init"
            );
            return Ok(());
        }
        let definition = match self.registry.get(responder_flow) {
            Ok(definition) => definition.clone(),
            Err(_) => {
                warn!(
                    from = %envelope.from_peer,
                    flow = responder_flow,
                    "rejecting session init for an unregistered responder flow"
                );
                // Without a reject the initiator would park on its first
                // receive forever.
                let reject = SessionEnvelope {
                    to_peer: envelope.from_peer.clone(),
                    to_session: Some(envelope.from_session),
                    from_peer: self.config.participant.clone(),
                    from_session: SessionId::new(),
                    sender_id: None,
                    seq: 0,
                    message: SessionMessage::ErrorEnd {
                        error: FlowError::Business(format!(
                            "no responder flow named '{}' is registered",
                            responder_flow
                        )),
                    },
                };
                return self.transport.send(reject).await;
            }
        };

        let run_id = FlowRunId::new();
        let local_session = SessionId::new();
        let mut checkpoint =
            Checkpoint::initial(responder_flow, definition.is_idempotent, &envelope.from_peer);
        checkpoint.invocation_context.initiated_by = Some(local_session);
        checkpoint.sessions.insert(
            local_session,
            SessionState::responding_to(&envelope.from_peer, envelope.from_session),
        );
        self.persist_initial(run_id, &checkpoint).await?;

        let mut state = StateMachineState::fresh(checkpoint, self.config.reload_after_suspend);
        state.is_any_checkpoint_persisted = true;

        self.session_index.register_local(local_session, run_id).await;
        self.session_index
            .link_peer(&envelope.from_peer, envelope.from_session, run_id, local_session)
            .await;

        info!(
            run_id = %run_id,
            flow = responder_flow,
            initiator = %envelope.from_peer,
            "starting responder flow"
        );
        self.spawn_fiber(
            run_id,
            definition.factory,
            Vec::new(),
            state,
            Some(local_session),
        )
        .await;
        Ok(())
    }
}

async fn router_loop(
    inner: Arc<RuntimeInner>,
    mut inbound: mpsc::UnboundedReceiver<SessionEnvelope>,
) {
    loop {
        let envelope = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            maybe = inbound.recv() => match maybe {
                Some(envelope) => envelope,
                None => break,
            },
        };
        if let Err(e) = inner.route(envelope).await {
            warn!(error = %e, "session envelope routing failed");
        }
    }
    debug!("session router stopped");
}

/// Prunes runtime tables when fibers exit. Hospital records are kept so a
/// run's medical history stays queryable post-mortem.
async fn exit_loop(inner: Arc<RuntimeInner>, mut exits: mpsc::UnboundedReceiver<FlowRunId>) {
    loop {
        let run_id = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            maybe = exits.recv() => match maybe {
                Some(run_id) => run_id,
                None => break,
            },
        };
        inner.fibers.lock().await.remove(&run_id);
        inner.session_index.forget_run(run_id).await;
    }
}

/// Builder for a [`FlowRuntime`].
pub struct FlowRuntimeBuilder {
    config: EngineConfig,
    registry: FlowRegistry,
    store: Option<Arc<dyn CheckpointStore>>,
    hospital: Option<Arc<FlowHospital>>,
    transport: Option<(
        Arc<dyn SessionTransport>,
        mpsc::UnboundedReceiver<SessionEnvelope>,
    )>,
    reload_hook: Option<ReloadHook>,
}

impl FlowRuntimeBuilder {
    /// Start building a runtime with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: FlowRegistry::new(),
            store: None,
            hospital: None,
            transport: None,
            reload_hook: None,
        }
    }

    /// Register a flow the runtime may start, locally or as a responder.
    pub fn register<F>(mut self, name: &str, is_idempotent: bool, factory: F) -> Self
    where
        F: Fn(Vec<u8>) -> Result<Box<dyn Flow>> + Send + Sync + 'static,
    {
        self.registry.register(name, is_idempotent, factory);
        self
    }

    /// Use a pre-built checkpoint store instead of the configured URL.
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom hospital instead of the configured default.
    pub fn with_hospital(mut self, hospital: Arc<FlowHospital>) -> Self {
        self.hospital = Some(hospital);
        self
    }

    /// Use a shared transport. `inbound` must be this participant's queue on
    /// that transport. Without this, the runtime gets a private
    /// [`LocalTransport`] and can only talk to itself.
    pub fn with_transport(
        mut self,
        transport: Arc<dyn SessionTransport>,
        inbound: mpsc::UnboundedReceiver<SessionEnvelope>,
    ) -> Self {
        self.transport = Some((transport, inbound));
        self
    }

    /// Observe every (re)spawn of flow logic. Diagnostic.
    pub fn with_reload_hook(mut self, hook: ReloadHook) -> Self {
        self.reload_hook = Some(hook);
        self
    }

    /// Build the runtime and start its router.
    pub async fn build(self) -> Result<FlowRuntime> {
        let store = match self.store {
            Some(store) => store,
            None => create_store(&self.config.database_url).await?,
        };
        let hospital = match self.hospital {
            Some(hospital) => hospital,
            None if self.config.strict_triage => Arc::new(FlowHospital::propagating()),
            None => Arc::new(FlowHospital::new(self.config.retry_policy())),
        };
        let (transport, inbound) = match self.transport {
            Some(pair) => pair,
            None => {
                let local = Arc::new(LocalTransport::new());
                let inbound = local.register(&self.config.participant).await;
                (local as Arc<dyn SessionTransport>, inbound)
            }
        };
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RuntimeInner {
            config: self.config,
            registry: self.registry,
            store,
            transport,
            hospital,
            reload_hook: self.reload_hook,
            session_index: Arc::new(SessionIndex::default()),
            dedup: Mutex::new(DedupTable::default()),
            fibers: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            exit_tx,
            shutdown: CancellationToken::new(),
        });
        let router = tokio::spawn(router_loop(Arc::clone(&inner), inbound));
        let reaper = tokio::spawn(exit_loop(Arc::clone(&inner), exit_rx));
        info!(
            participant = %inner.config.participant,
            flows = ?inner.registry.names(),
            "flow runtime started"
        );
        Ok(FlowRuntime {
            inner,
            router,
            reaper,
        })
    }
}

/// One participant's flow engine.
pub struct FlowRuntime {
    inner: Arc<RuntimeInner>,
    router: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl FlowRuntime {
    /// This runtime's participant name.
    pub fn participant(&self) -> &str {
        &self.inner.config.participant
    }

    /// Start a registered flow with the given serialized arguments.
    ///
    /// The initial checkpoint is committed before the fiber spawns. For
    /// idempotent flows it is also the only checkpoint: incremental ones are
    /// elided and a retry replays the whole flow from its start.
    pub async fn start_flow(&self, flow_name: &str, args: Vec<u8>) -> Result<FlowRunId> {
        let definition = self.inner.registry.get(flow_name)?.clone();
        let run_id = FlowRunId::new();
        let mut checkpoint = Checkpoint::initial(
            flow_name,
            definition.is_idempotent,
            &self.inner.config.participant,
        );
        checkpoint.start_args = args.clone();
        self.inner.persist_initial(run_id, &checkpoint).await?;

        let mut state =
            StateMachineState::fresh(checkpoint, self.inner.config.reload_after_suspend);
        state.is_any_checkpoint_persisted = true;

        info!(run_id = %run_id, flow = flow_name, "starting flow");
        self.inner
            .spawn_fiber(run_id, definition.factory, args, state, None)
            .await;
        Ok(run_id)
    }

    /// Await a flow's outcome. Consumes the run's result slot; a second call
    /// for the same run returns [`EngineError::FlowNotFound`].
    pub async fn result(&self, run_id: FlowRunId) -> Result<Vec<u8>> {
        let receiver = self
            .inner
            .results
            .lock()
            .await
            .remove(&run_id)
            .ok_or(EngineError::FlowNotFound(run_id))?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::FiberGone(run_id)),
        }
    }

    /// The stored status of a run. Completed runs have no row and report
    /// [`EngineError::FlowNotFound`].
    pub async fn status(&self, run_id: FlowRunId) -> Result<FlowStatus> {
        match self.inner.store.read(run_id).await? {
            Some(checkpoint) => Ok(checkpoint.status),
            None => Err(EngineError::FlowNotFound(run_id)),
        }
    }

    /// Stored flows with the given status.
    pub async fn list_by_status(&self, status: FlowStatus) -> Result<Vec<StoredFlow>> {
        self.inner.store.list_by_status(status).await
    }

    /// Number of quarantined runs awaiting operator action.
    pub async fn count_hospitalized(&self) -> Result<i64> {
        self.inner.store.count_by_status(FlowStatus::Hospitalized).await
    }

    /// Discard unpersisted progress and resume a run from its last committed
    /// checkpoint. Revives quarantined runs that no longer hold a fiber.
    pub async fn retry(&self, run_id: FlowRunId) -> Result<()> {
        if let Some(events) = self.inner.fiber_events(run_id).await {
            events
                .send(Event::RetryFlowFromSafePoint)
                .map_err(|_| EngineError::FiberGone(run_id))?;
            return Ok(());
        }
        self.wake(run_id).await
    }

    /// Kill a run. A live fiber fails with [`FlowError::Killed`] and
    /// propagates the error to its counterparties; a parked row is deleted
    /// directly.
    pub async fn kill(&self, run_id: FlowRunId) -> Result<()> {
        if let Some(events) = self.inner.fiber_events(run_id).await {
            events
                .send(Event::KillFlow)
                .map_err(|_| EngineError::FiberGone(run_id))?;
            return Ok(());
        }
        if self.inner.store.read(run_id).await?.is_none() {
            return Err(EngineError::FlowNotFound(run_id));
        }
        self.inner.delete_row(run_id).await?;
        self.inner.session_index.forget_run(run_id).await;
        info!(run_id = %run_id, "killed parked flow");
        Ok(())
    }

    /// Hold a run: its status becomes `Paused`, its checkpoint is retained,
    /// and its fiber (if any) is released.
    pub async fn pause(&self, run_id: FlowRunId) -> Result<()> {
        if let Some(events) = self.inner.fiber_events(run_id).await {
            events
                .send(Event::Pause)
                .map_err(|_| EngineError::FiberGone(run_id))?;
            return Ok(());
        }
        if self.inner.store.read(run_id).await?.is_none() {
            return Err(EngineError::FlowNotFound(run_id));
        }
        self.inner.set_status(run_id, FlowStatus::Paused).await
    }

    /// Resume a parked run from its committed checkpoint. No-op when the run
    /// already holds a fiber.
    pub async fn wake(&self, run_id: FlowRunId) -> Result<()> {
        if self.inner.fiber_events(run_id).await.is_some() {
            return Ok(());
        }
        let Some(mut checkpoint) = self.inner.store.read(run_id).await? else {
            return Err(EngineError::FlowNotFound(run_id));
        };
        self.inner.set_status(run_id, FlowStatus::Runnable).await?;
        checkpoint.status = FlowStatus::Runnable;
        info!(run_id = %run_id, flow = %checkpoint.flow_name, "waking parked flow");
        self.inner.revive(run_id, checkpoint).await
    }

    /// Revive every stored `Runnable` run that lost its fiber, typically
    /// after a restart. Quarantined and paused runs are left for the
    /// operator. Returns how many runs were revived.
    pub async fn recover(&self) -> Result<usize> {
        let rows = self.inner.store.list_by_status(FlowStatus::Runnable).await?;
        let mut revived = 0;
        for row in rows {
            if self.inner.fiber_events(row.run_id).await.is_some() {
                continue;
            }
            let Some(checkpoint) = self.inner.store.read(row.run_id).await? else {
                continue;
            };
            self.inner.revive(row.run_id, checkpoint).await?;
            revived += 1;
        }
        if revived > 0 {
            info!(count = revived, "revived runnable flows from the store");
        }
        Ok(revived)
    }

    /// The hospital's admission history for a run.
    pub async fn medical_history(&self, run_id: FlowRunId) -> Vec<MedicalRecord> {
        self.inner.hospital.medical_history(run_id).await
    }

    /// Stop the router and abort every live fiber. Committed checkpoints
    /// survive; anything unpersisted is lost, as it would be in a crash.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut fibers = self.inner.fibers.lock().await;
        for (_, handle) in fibers.drain() {
            handle.task.abort();
        }
        drop(fibers);
        self.router.abort();
        self.reaper.abort();
        info!(participant = %self.inner.config.participant, "flow runtime shut down");
    }
}
