// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interprets transition output against real infrastructure.
//!
//! One event-processing step: open a store transaction, run the pure
//! transition, interpret its actions in order, and verify the
//! transactional-boundary contract held. Exactly one commit or rollback
//! must close the ambient transaction; persistence actions outside an open
//! transaction, or a transaction left open at the end of a step, are
//! contract violations and poison the fiber.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{EngineError, FlowError, Result};
use crate::events::{Action, Event, FlowContinuation};
use crate::hospital::{Diagnosis, FlowHospital};
use crate::session::{SessionEnvelope, SessionTransport};
use crate::state::{FlowRunId, FlowStatus, StateMachineState};
use crate::store::{CheckpointStore, StoreTransaction};
use crate::transitions::transition;

/// What the fiber learns from one executed step.
pub(crate) struct StepOutcome {
    /// The continuation to act on.
    pub(crate) continuation: FlowContinuation,
    /// Set when the step ordered a respawn: the state to restart flow
    /// logic from.
    pub(crate) respawn_from: Option<StateMachineState>,
    /// Set when the step removed the flow from the runtime.
    pub(crate) remove_flow: bool,
}

/// Executes transitions for one fiber.
pub(crate) struct TransitionExecutor {
    run_id: FlowRunId,
    participant: String,
    store: Arc<dyn CheckpointStore>,
    transport: Arc<dyn SessionTransport>,
    hospital: Arc<FlowHospital>,
    events_tx: mpsc::UnboundedSender<Event>,
    reload_after_suspend: bool,
    tx_slot: Option<Box<dyn StoreTransaction>>,
}

impl TransitionExecutor {
    pub(crate) fn new(
        run_id: FlowRunId,
        participant: String,
        store: Arc<dyn CheckpointStore>,
        transport: Arc<dyn SessionTransport>,
        hospital: Arc<FlowHospital>,
        events_tx: mpsc::UnboundedSender<Event>,
        reload_after_suspend: bool,
    ) -> Self {
        Self {
            run_id,
            participant,
            store,
            transport,
            hospital,
            events_tx,
            reload_after_suspend,
            tx_slot: None,
        }
    }

    /// Run one event through the transition engine and interpret the
    /// resulting actions. Returns the updated state and the step outcome.
    pub(crate) async fn process_event(
        &mut self,
        event: &Event,
        state: &StateMachineState,
    ) -> Result<(StateMachineState, StepOutcome)> {
        debug!(run_id = %self.run_id, event = ?event, "processing event");
        let result = transition(event, state)?;

        if state.is_killed && !result.state.is_killed {
            return Err(EngineError::contract(
                "executor",
                "kill flag cleared by a transition",
            ));
        }
        if state.is_killed && matches!(result.continuation, FlowContinuation::Resume { .. }) {
            return Err(EngineError::contract(
                "executor",
                "resume issued for a killed flow",
            ));
        }

        self.tx_slot = Some(self.store.begin().await?);
        let mut new_state = result.state;
        let mut outcome = StepOutcome {
            continuation: result.continuation,
            respawn_from: None,
            remove_flow: false,
        };

        let interpreted = self
            .interpret(result.actions, &mut new_state, &mut outcome)
            .await;
        if let Err(e) = interpreted {
            if let Some(tx) = self.tx_slot.take() {
                if let Err(rb) = tx.rollback().await {
                    error!(run_id = %self.run_id, error = %rb, "rollback after failed step also failed");
                }
            }
            return Err(e);
        }
        if self.tx_slot.take().is_some() {
            return Err(EngineError::contract(
                "executor",
                "transaction left open at end of step",
            ));
        }
        Ok((new_state, outcome))
    }

    async fn interpret(
        &mut self,
        actions: Vec<Action>,
        state: &mut StateMachineState,
        outcome: &mut StepOutcome,
    ) -> Result<()> {
        let store = Arc::clone(&self.store);
        let run_id = self.run_id;
        for action in actions {
            match action {
                Action::PersistCheckpoint { checkpoint } => {
                    let tx = self.open_tx("persist checkpoint")?;
                    store.write(tx.as_mut(), run_id, &checkpoint).await?;
                }
                Action::RemoveCheckpoint => {
                    let tx = self.open_tx("remove checkpoint")?;
                    store.delete(tx.as_mut(), run_id).await?;
                }
                Action::UpdateFlowStatus { status } => {
                    let tx = self.open_tx("update status")?;
                    store.update_status(tx.as_mut(), run_id, status).await?;
                }
                Action::CommitTransaction => {
                    let tx = self.take_tx("commit")?;
                    tx.commit().await?;
                }
                Action::RollbackTransaction => {
                    let tx = self.take_tx("rollback")?;
                    tx.rollback().await?;
                }
                Action::SendSessionMessage {
                    session_id,
                    message,
                    seq,
                } => {
                    let Some(session) = state.checkpoint.sessions.get(&session_id) else {
                        return Err(EngineError::contract(
                            "executor",
                            format!("send ordered on unknown session {}", session_id),
                        ));
                    };
                    let envelope = SessionEnvelope {
                        to_peer: session.peer.clone(),
                        to_session: session.peer_session,
                        from_peer: self.participant.clone(),
                        from_session: session_id,
                        sender_id: state.sender_id,
                        seq,
                        message,
                    };
                    self.transport.send(envelope).await?;
                }
                Action::ScheduleEvent { event, delay_ms } => {
                    self.enqueue_after(*event, Duration::from_millis(delay_ms));
                }
                Action::ReleaseSoftLocks => {
                    if !state.soft_locked_refs.is_empty() {
                        debug!(
                            run_id = %self.run_id,
                            count = state.soft_locked_refs.len(),
                            "releasing soft locks"
                        );
                    }
                    state.soft_locked_refs.clear();
                }
                Action::TriageFlow => {
                    self.triage(state).await?;
                }
                Action::RespawnFromCheckpoint => {
                    let checkpoint = self.store.read(self.run_id).await?.ok_or_else(|| {
                        EngineError::CheckpointReload {
                            flow_name: state.checkpoint.flow_name.clone(),
                            suspend_ordinal: state.checkpoint.suspend_ordinal,
                            reason: "no committed checkpoint to respawn from".to_string(),
                        }
                    })?;
                    outcome.respawn_from = Some(StateMachineState::restored(
                        checkpoint,
                        self.reload_after_suspend,
                    ));
                }
                Action::RemoveFlow => {
                    outcome.remove_flow = true;
                }
            }
        }
        Ok(())
    }

    /// Hand the flow to the hospital and act on the diagnosis.
    async fn triage(&mut self, state: &mut StateMachineState) -> Result<()> {
        let error = state
            .checkpoint
            .errors
            .last()
            .cloned()
            .unwrap_or_else(|| FlowError::Business("flow failed with no recorded error".into()));
        match self.hospital.flow_errored(self.run_id, error).await {
            Diagnosis::Retry { backoff } => {
                self.enqueue_after(Event::RetryFlowFromSafePoint, backoff);
            }
            Diagnosis::Quarantine => {
                // The step's transaction is already closed; the status flip
                // gets its own short one.
                state.checkpoint.status = FlowStatus::Hospitalized;
                let mut tx = self.store.begin().await?;
                self.store
                    .update_status(tx.as_mut(), self.run_id, FlowStatus::Hospitalized)
                    .await?;
                tx.commit().await?;
                warn!(run_id = %self.run_id, "flow quarantined, awaiting operator");
            }
            Diagnosis::Terminal => {
                if self.events_tx.send(Event::StartErrorPropagation).is_err() {
                    warn!(run_id = %self.run_id, "fiber queue closed, dropping propagation event");
                }
            }
        }
        Ok(())
    }

    fn enqueue_after(&self, event: Event, delay: Duration) {
        let events_tx = self.events_tx.clone();
        let run_id = self.run_id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events_tx.send(event).is_err() {
                debug!(run_id = %run_id, "fiber queue closed, dropping scheduled event");
            }
        });
    }

    fn open_tx(&mut self, during: &str) -> Result<&mut Box<dyn StoreTransaction>> {
        self.tx_slot.as_mut().ok_or_else(|| {
            EngineError::contract(
                "executor",
                format!("{} ordered outside an open transaction", during),
            )
        })
    }

    fn take_tx(&mut self, during: &str) -> Result<Box<dyn StoreTransaction>> {
        self.tx_slot.take().ok_or_else(|| {
            EngineError::contract(
                "executor",
                format!("{} ordered with no open transaction", during),
            )
        })
    }
}
