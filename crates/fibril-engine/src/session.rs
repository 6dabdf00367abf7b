// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sessions: ordered, deduplicated message channels between two flows.
//!
//! A session is created by `initiate_flow` and carries typed messages until
//! both ends have exchanged close confirmations. Delivery is at-least-once;
//! deduplication uses the sender's stable identity plus a per-session
//! sequence number, and is skipped when the sender identity is absent
//! (flows restored from checkpoint).

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::{EngineError, FlowError, Result};
use crate::state::{SenderId, SessionId};

/// A typed message carried over a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Opens a session: asks the destination to start a responder flow.
    Init {
        /// Registered name of the responder flow to start.
        responder_flow: String,
    },
    /// Application payload.
    Data {
        /// Opaque payload bytes.
        payload: Vec<u8>,
    },
    /// The sender has finished with this session and requests confirmation.
    Close,
    /// Confirms a [`SessionMessage::Close`].
    CloseAck,
    /// The sender's flow ended abnormally; the session is dead.
    ErrorEnd {
        /// The error that ended the counterparty flow.
        error: FlowError,
    },
}

/// An inbound item buffered on a session awaiting a `receive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferedItem {
    /// A data payload.
    Data(Vec<u8>),
    /// The counterparty ended abnormally; delivered as an error to the
    /// next `receive` on this session.
    ErrorEnd(FlowError),
}

/// Lifecycle of one end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Open for sending and receiving.
    Open,
    /// We sent a close and are awaiting the counterparty's confirmation.
    CloseRequested,
    /// Both ends confirmed close, or the counterparty closed first.
    Closed,
    /// The counterparty ended abnormally.
    Errored,
}

/// Per-session state carried inside the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Destination participant name.
    pub peer: String,
    /// The counterparty's session id, once known.
    pub peer_session: Option<SessionId>,
    /// Sequence number for the next outbound message.
    pub next_send_seq: u64,
    /// Inbound items not yet consumed by a `receive`.
    pub buffered: VecDeque<BufferedItem>,
    /// Session lifecycle status.
    pub status: SessionStatus,
}

impl SessionState {
    /// A freshly initiated session toward `peer`.
    pub fn new(peer: &str) -> Self {
        SessionState {
            peer: peer.to_string(),
            peer_session: None,
            next_send_seq: 0,
            buffered: VecDeque::new(),
            status: SessionStatus::Open,
        }
    }

    /// A responder-side session created from an inbound `Init`.
    pub fn responding_to(peer: &str, peer_session: SessionId) -> Self {
        SessionState {
            peer: peer.to_string(),
            peer_session: Some(peer_session),
            next_send_seq: 0,
            buffered: VecDeque::new(),
            status: SessionStatus::Open,
        }
    }
}

/// A routable session message with addressing and dedup metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    /// Destination participant.
    pub to_peer: String,
    /// Destination session id, when the sender knows it.
    pub to_session: Option<SessionId>,
    /// Source participant.
    pub from_peer: String,
    /// Source session id.
    pub from_session: SessionId,
    /// Sender identity for dedup; absent for restored flows.
    pub sender_id: Option<SenderId>,
    /// Per-session outbound sequence number.
    pub seq: u64,
    /// The message itself.
    pub message: SessionMessage,
}

/// Reliable, ordered, at-least-once delivery between participants.
///
/// Implementations deliver envelopes to the destination participant's
/// inbound queue; per-session ordering must be preserved. The engine
/// performs sender-id deduplication on the receiving side.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Deliver an envelope toward its destination participant.
    async fn send(&self, envelope: SessionEnvelope) -> Result<()>;
}

/// In-process transport connecting runtimes in the same process.
///
/// Each participant registers once and receives the inbound half of an
/// unbounded channel; per-sender FIFO ordering comes from the channel.
pub struct LocalTransport {
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<SessionEnvelope>>>,
}

impl LocalTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        LocalTransport {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a participant and return its inbound envelope queue.
    ///
    /// Re-registering a name replaces the previous queue.
    pub async fn register(&self, participant: &str) -> mpsc::UnboundedReceiver<SessionEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().await.insert(participant.to_string(), tx);
        rx
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionTransport for LocalTransport {
    async fn send(&self, envelope: SessionEnvelope) -> Result<()> {
        let peers = self.peers.lock().await;
        let Some(tx) = peers.get(&envelope.to_peer) else {
            return Err(EngineError::Config {
                var: "transport".to_string(),
                reason: format!("unknown participant '{}'", envelope.to_peer),
            });
        };
        debug!(
            to = %envelope.to_peer,
            from_session = %envelope.from_session,
            seq = envelope.seq,
            "delivering session envelope"
        );
        tx.send(envelope)
            .map_err(|_| EngineError::Config {
                var: "transport".to_string(),
                reason: "participant inbound queue closed".to_string(),
            })?;
        Ok(())
    }
}

/// Receiver-side dedup table: last sequence number seen per sender per
/// local session. Messages without a sender id are never deduplicated.
#[derive(Debug, Default)]
pub(crate) struct DedupTable {
    seen: HashMap<(SessionId, SenderId), u64>,
}

impl DedupTable {
    /// Record the envelope and report whether it is a duplicate.
    pub(crate) fn is_duplicate(&mut self, local_session: SessionId, envelope: &SessionEnvelope) -> bool {
        let Some(sender) = envelope.sender_id else {
            return false;
        };
        match self.seen.get_mut(&(local_session, sender)) {
            Some(last) if envelope.seq <= *last => true,
            Some(last) => {
                *last = envelope.seq;
                false
            }
            None => {
                self.seen.insert((local_session, sender), envelope.seq);
                false
            }
        }
    }
}
