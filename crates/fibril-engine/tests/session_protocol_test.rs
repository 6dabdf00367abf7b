// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session protocol between two runtimes: a clean request/reply exchange,
//! a counterparty failure, and an initiation rejected by the remote side.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use fibril_engine::{
    EngineError, Flow, FlowContext, FlowError, FlowRuntime, FlowStatus, LocalTransport,
    SessionTransport,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct NoState;

/// Opens a session to "bob", sends a request, and returns the reply.
struct QuoteRequester {
    responder_flow: &'static str,
}

#[async_trait::async_trait]
impl Flow for QuoteRequester {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let state = NoState;
        let session = ctx.initiate_flow("bob", self.responder_flow).await?;
        ctx.send(&state, session, b"widget".to_vec()).await?;
        ctx.receive(&state, session).await
    }
}

/// Answers a single quote request and finishes.
struct QuoteResponder;

#[async_trait::async_trait]
impl Flow for QuoteResponder {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let session = ctx
            .initiated_by()
            .ok_or_else(|| FlowError::Business("responder started without a session".into()))?;
        let state = NoState;
        let _request = ctx.receive(&state, session).await?;
        ctx.send(&state, session, b"420".to_vec()).await?;
        Ok(Vec::new())
    }
}

/// Reads the request and fails with a business fault.
struct OutOfStockResponder;

#[async_trait::async_trait]
impl Flow for OutOfStockResponder {
    async fn call(&self, ctx: &mut FlowContext) -> Result<Vec<u8>, FlowError> {
        let session = ctx
            .initiated_by()
            .ok_or_else(|| FlowError::Business("responder started without a session".into()))?;
        let _request = ctx.receive(&NoState, session).await?;
        Err(FlowError::Business("out of stock".into()))
    }
}

async fn paired_runtimes(responder_flow: &'static str) -> (FlowRuntime, FlowRuntime) {
    let transport = Arc::new(LocalTransport::new());
    let alice_inbound = transport.register("alice").await;
    let bob_inbound = transport.register("bob").await;

    let alice = runtime("alice")
        .register("quote_requester", false, move |_args| {
            Ok(Box::new(QuoteRequester { responder_flow }) as Box<dyn Flow>)
        })
        .with_transport(
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            alice_inbound,
        )
        .build()
        .await
        .unwrap();

    let bob = runtime("bob")
        .register("quote_responder", false, |_args| {
            Ok(Box::new(QuoteResponder) as Box<dyn Flow>)
        })
        .register("out_of_stock", false, |_args| {
            Ok(Box::new(OutOfStockResponder) as Box<dyn Flow>)
        })
        .with_transport(
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            bob_inbound,
        )
        .build()
        .await
        .unwrap();

    (alice, bob)
}

/// Poll until `list_by_status` on `runtime` reports `expected` rows,
/// panicking after 5 seconds.
async fn wait_for_listed(runtime: &FlowRuntime, status: FlowStatus, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let listed = runtime.list_by_status(status).await.unwrap();
        if listed.len() == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} rows with status {} never appeared (saw {})",
            expected,
            status,
            listed.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let (alice, bob) = paired_runtimes("quote_responder").await;

    let run_id = alice
        .start_flow("quote_requester", Vec::new())
        .await
        .unwrap();
    let reply = alice.result(run_id).await.unwrap();
    assert_eq!(reply, b"420");

    // Both sides completed and cleaned up their rows.
    assert!(matches!(
        alice.status(run_id).await,
        Err(EngineError::FlowNotFound(_))
    ));
    wait_for_listed(&bob, FlowStatus::Runnable, 0).await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_responder_failure_ends_the_session() {
    let (alice, bob) = paired_runtimes("out_of_stock").await;

    let run_id = alice
        .start_flow("quote_requester", Vec::new())
        .await
        .unwrap();
    let result = alice.result(run_id).await;
    assert!(matches!(
        result,
        Err(EngineError::Flow(FlowError::UnexpectedSessionEnd { .. }))
    ));

    wait_for_status(&alice, run_id, FlowStatus::Failed).await;
    wait_for_listed(&bob, FlowStatus::Failed, 1).await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_initiation_to_unknown_flow_is_rejected() {
    let (alice, bob) = paired_runtimes("no_such_flow").await;

    let run_id = alice
        .start_flow("quote_requester", Vec::new())
        .await
        .unwrap();
    let result = alice.result(run_id).await;
    assert!(matches!(
        result,
        Err(EngineError::Flow(FlowError::UnexpectedSessionEnd { .. }))
    ));
    wait_for_status(&alice, run_id, FlowStatus::Failed).await;

    alice.shutdown().await;
    bob.shutdown().await;
}
