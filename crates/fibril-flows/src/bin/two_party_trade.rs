// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Two-Party Trade - a session between two flow runtimes.
//!
//! This example shows:
//! - Two runtimes ("alice" and "bob") sharing one transport
//! - A proposer flow opening a session to a responder flow by name
//! - A short price negotiation over session messages
//! - Checkpointed state carried across every receive
//!
//! Run with: cargo run -p fibril-flows --bin two_party_trade

use std::sync::Arc;

use fibril_engine::{
    EngineConfig, Flow, FlowContext, FlowError, FlowRuntimeBuilder, LocalTransport,
    SessionTransport,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// What the proposer asks for.
#[derive(Debug, Serialize, Deserialize)]
struct Proposal {
    item: String,
    quantity: u32,
    unit_price_cents: i64,
}

/// The responder's verdict on a proposal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
enum Verdict {
    Accepted { total_cents: i64 },
    Countered { unit_price_cents: i64 },
}

/// Checkpointed negotiation state on the proposer side.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProposerState {
    offer_cents: i64,
    round: u32,
}

struct TradeProposer;

#[async_trait::async_trait]
impl Flow for TradeProposer {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let mut state: ProposerState = ctx.restored_state()?.unwrap_or(ProposerState {
            offer_cents: 800,
            round: 0,
        });

        let session = ctx.initiate_flow("bob", "trade_responder").await?;
        info!(session = %session, "session opened to bob");

        loop {
            state.round += 1;
            if state.round > 3 {
                return Err(FlowError::Business("no agreement after 3 rounds".into()));
            }

            let proposal = Proposal {
                item: "widget".into(),
                quantity: 10,
                unit_price_cents: state.offer_cents,
            };
            info!(round = state.round, offer = state.offer_cents, "sending proposal");
            let payload = serde_json::to_vec(&proposal)
                .map_err(|e| FlowError::Business(e.to_string()))?;
            ctx.send(&state, session, payload).await?;

            let reply = ctx.receive(&state, session).await?;
            let verdict: Verdict = serde_json::from_slice(&reply)
                .map_err(|e| FlowError::Business(e.to_string()))?;
            match verdict {
                Verdict::Accepted { total_cents } => {
                    info!(total = total_cents, "proposal accepted");
                    return serde_json::to_vec(&serde_json::json!({
                        "item": proposal.item,
                        "quantity": proposal.quantity,
                        "total_cents": total_cents,
                        "rounds": state.round,
                    }))
                    .map_err(|e| FlowError::Business(e.to_string()));
                }
                Verdict::Countered { unit_price_cents } => {
                    info!(counter = unit_price_cents, "counter-offer received");
                    state.offer_cents = unit_price_cents;
                }
            }
        }
    }
}

/// Checkpointed state on the responder side.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ResponderState {
    offers_seen: u32,
}

struct TradeResponder {
    floor_cents: i64,
}

#[async_trait::async_trait]
impl Flow for TradeResponder {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let session = ctx
            .initiated_by()
            .ok_or_else(|| FlowError::Business("responder started without a session".into()))?;
        let mut state: ResponderState = ctx.restored_state()?.unwrap_or_default();

        loop {
            let payload = ctx.receive(&state, session).await?;
            let proposal: Proposal = serde_json::from_slice(&payload)
                .map_err(|e| FlowError::Business(e.to_string()))?;
            state.offers_seen += 1;

            let verdict = if proposal.unit_price_cents >= self.floor_cents {
                let total = proposal.unit_price_cents * i64::from(proposal.quantity);
                info!(total, "accepting proposal");
                Verdict::Accepted { total_cents: total }
            } else {
                info!(floor = self.floor_cents, "countering below-floor proposal");
                Verdict::Countered {
                    unit_price_cents: self.floor_cents,
                }
            };
            let accepted = matches!(verdict, Verdict::Accepted { .. });
            let reply = serde_json::to_vec(&verdict)
                .map_err(|e| FlowError::Business(e.to_string()))?;
            ctx.send(&state, session, reply).await?;
            if accepted {
                return Ok(Vec::new());
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("=== Two-Party Trade: Session Negotiation ===");

    let transport = Arc::new(LocalTransport::new());
    let alice_inbound = transport.register("alice").await;
    let bob_inbound = transport.register("bob").await;

    let alice = FlowRuntimeBuilder::new(EngineConfig::new("alice"))
        .register("trade_proposer", false, |_args| {
            Ok(Box::new(TradeProposer) as Box<dyn Flow>)
        })
        .with_transport(
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            alice_inbound,
        )
        .build()
        .await?;

    let bob = FlowRuntimeBuilder::new(EngineConfig::new("bob"))
        .register("trade_responder", false, |_args| {
            Ok(Box::new(TradeResponder { floor_cents: 1000 }) as Box<dyn Flow>)
        })
        .with_transport(
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            bob_inbound,
        )
        .build()
        .await?;

    let run_id = alice.start_flow("trade_proposer", Vec::new()).await?;
    info!(run_id = %run_id, "trade started");

    let outcome = alice.result(run_id).await?;
    let summary: serde_json::Value = serde_json::from_slice(&outcome)?;
    info!(summary = %summary, "trade settled");

    alice.shutdown().await;
    bob.shutdown().await;

    info!("=== Two-Party Trade Complete ===");
    Ok(())
}
