// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fibril Engine - Durable Flow Execution
//!
//! This crate provides a checkpointed execution engine for cooperative,
//! replay-safe flows. Flow logic suspends at explicit points (receive, sleep,
//! async operations, forced checkpoints); every persisting suspend commits a
//! [`Checkpoint`] that is sufficient, alone, to resume the flow after total
//! process loss. Failures are rolled back to the last committed checkpoint and
//! triaged by the [`hospital`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       FlowRuntime                            │
//! │     start / result / retry / kill / pause / wake / recover   │
//! └──────────────────────────────────────────────────────────────┘
//!        │ spawns                   ▲ routes inbound envelopes
//!        ▼                          │
//! ┌───────────────┐          ┌──────────────┐       ┌────────────┐
//! │    Fiber      │◄────────►│SessionRouter │◄─────►│ Transport  │
//! │ (one per run) │  events  └──────────────┘       │ (peers)    │
//! └───────────────┘                                 └────────────┘
//!        │ transitions + actions
//!        ▼
//! ┌───────────────┐          ┌──────────────┐
//! │ Transition    │─────────►│ FlowHospital │
//! │ Executor      │  triage  └──────────────┘
//! └───────────────┘
//!        │ transactional writes
//!        ▼
//! ┌──────────────────────────────┐
//! │        CheckpointStore       │
//! │  (memory / SQLite / Postgres)│
//! └──────────────────────────────┘
//! ```
//!
//! Each flow run owns a fiber: a task that processes the run's events
//! strictly one at a time. Flow logic runs in its own task and talks to the
//! fiber over a request channel; a parked flow holds no thread. Respawns
//! re-create the logic task from the committed checkpoint and let it replay
//! to its suspend point.
//!
//! # Flow Status State Machine
//!
//! ```text
//!                 ┌──────────┐
//!       ┌─────────│ Runnable │─────────┐
//!       │         └────┬─────┘         │
//!  pause│     transient│fault     business fault /
//!       │     (ceiling │exceeded)  kill
//!       ▼              ▼               ▼
//! ┌────────┐   ┌──────────────┐   ┌────────┐
//! │ Paused │   │ Hospitalized │   │ Failed │
//! └───┬────┘   └──────┬───────┘   └────────┘
//!     │ wake          │ retry
//!     └───────┬───────┘
//!             ▼
//!        ┌──────────┐   finish   ┌───────────┐
//!        │ Runnable │───────────►│ Completed │  (row removed)
//!        └──────────┘            └───────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use fibril_engine::{EngineConfig, Flow, FlowContext, FlowError, FlowRuntimeBuilder};
//!
//! struct GreetFlow;
//!
//! #[async_trait::async_trait]
//! impl Flow for GreetFlow {
//!     async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
//!         ctx.progress("greeting").await?;
//!         Ok(b"hello".to_vec())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> fibril_engine::Result<()> {
//!     let runtime = FlowRuntimeBuilder::new(EngineConfig::new("alice"))
//!         .register("greet", false, |_args| Ok(Box::new(GreetFlow)))
//!         .build()
//!         .await?;
//!
//!     let run_id = runtime.start_flow("greet", Vec::new()).await?;
//!     let result = runtime.result(run_id).await?;
//!     assert_eq!(result, b"hello");
//!     Ok(())
//! }
//! ```
//!
//! # Checkpoint Semantics
//!
//! - Every suspending operation takes the flow's state object; that object,
//!   serialized, is the checkpointed continuation. After a restore, `call`
//!   runs again from the top with [`FlowContext::restored_state`] returning
//!   the last checkpointed state, and the flow skips completed work.
//! - Send-only operations never park and skip persistence.
//! - Inside an idempotent boundary (idempotent root flow or any idempotent
//!   sub-flow frame) incremental checkpoints are elided once an initial
//!   checkpoint exists; a retry replays the boundary in full.
//!
//! # Failure Triage
//!
//! Errors raised by initialized flows are rolled back and admitted to the
//! [`FlowHospital`]. Transient faults (anywhere in the cause chain) are
//! retried with doubling backoff up to a ceiling, then quarantined under
//! `Hospitalized`. Business faults are terminal: the run fails and an error
//! end is propagated to every open session counterparty.

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod events;
mod executor;
mod fiber;
pub mod hospital;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod state;
pub mod store;
mod transitions;

pub use config::EngineConfig;
pub use context::{Flow, FlowContext};
pub use error::{EngineError, FlowError, Result};
pub use fiber::ReloadHook;
pub use hospital::{
    Admission, Diagnosis, FlowHospital, MedicalRecord, Opinion, RetryPolicy, Specialist,
};
pub use registry::{FlowDefinition, FlowFactory, FlowRegistry};
pub use runtime::{FlowRuntime, FlowRuntimeBuilder};
pub use session::{
    LocalTransport, SessionEnvelope, SessionMessage, SessionState, SessionTransport,
};
pub use state::{Checkpoint, FlowRunId, FlowStatus, SessionId};
pub use store::{CheckpointStore, MemoryStore, StoredFlow, create_store};
