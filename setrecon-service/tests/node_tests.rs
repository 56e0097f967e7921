mod common;

use common::{element, init_tracing, name_set, names};
use pretty_assertions::assert_eq;
use async_trait::async_trait;
use setrecon_service::{
    spawn, spawn_with, ClientEvent, Dialer, MemoryHub, NodeHandle, OperationId,
    OperationOptions, ReconError, ReconResult, ResultMode, ResultStatus, ServiceConfig, SetId,
    SetService,
};
use setrecon_types::{AppId, Element, OperationType, PeerId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn node(hub: &Arc<MemoryHub>) -> (NodeHandle, UnboundedReceiver<ClientEvent>) {
    init_tracing();
    let service = SetService::new(PeerId::new(), ServiceConfig::default()).unwrap();
    spawn(service, hub.clone()).await
}

async fn make_set(node: &NodeHandle, op_type: OperationType, items: Vec<Element>) -> SetId {
    node.call(move |svc| {
        let set = svc.create_set(op_type);
        for e in items {
            svc.add_element(set, e).unwrap();
        }
        set
    })
    .await
}

async fn next_request(events: &mut UnboundedReceiver<ClientEvent>) -> setrecon_service::RequestId {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("event channel closed");
        if let ClientEvent::Request { request, .. } = event {
            return request;
        }
    }
}

/// Collects results of `op` up to its terminal status.
async fn results_of(
    events: &mut UnboundedReceiver<ClientEvent>,
    op: OperationId,
) -> (BTreeSet<String>, ResultStatus) {
    let mut added = Vec::new();
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for results")
            .expect("event channel closed");
        match event {
            ClientEvent::Result {
                operation,
                element: Some(e),
                status: ResultStatus::Added,
            } if operation == op => added.push(e),
            ClientEvent::Result {
                operation,
                element: None,
                status,
            } if operation == op => return (names(&added), status),
            _ => {}
        }
    }
}

fn numbered(prefix: &str, count: usize) -> Vec<Element> {
    (0..count).map(|i| element(&format!("{prefix}-{i}"))).collect()
}

// ── End to end ──────────────────────────────────────────────────

#[tokio::test]
async fn union_over_streams() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub).await;
    let (bob, mut bob_events) = node(&hub).await;
    let app = AppId::from_name("node-tests");

    let shared = numbered("shared", 300);
    let only_a = numbered("a", 5);
    let only_b = numbered("b", 5);
    let set_a = make_set(
        &alice,
        OperationType::Union,
        shared.iter().chain(&only_a).cloned().collect(),
    )
    .await;
    let set_b = make_set(
        &bob,
        OperationType::Union,
        shared.iter().chain(&only_b).cloned().collect(),
    )
    .await;
    bob.call(move |svc| svc.listen(OperationType::Union, app))
        .await
        .unwrap();

    let to = bob.peer();
    let op_a = alice
        .call(move |svc| {
            svc.evaluate(set_a, to, app, None, ResultMode::Added, OperationOptions::default())
        })
        .await
        .unwrap();

    let request = next_request(&mut bob_events).await;
    let op_b = bob
        .call(move |svc| {
            svc.accept(request, set_b, ResultMode::Added, OperationOptions::default())
        })
        .await
        .unwrap();

    let (added_a, status_a) = results_of(&mut alice_events, op_a).await;
    let (added_b, status_b) = results_of(&mut bob_events, op_b).await;
    assert_eq!(status_a, ResultStatus::Done);
    assert_eq!(status_b, ResultStatus::Done);
    assert_eq!(added_a, names(&only_b));
    assert_eq!(added_b, names(&only_a));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn intersection_over_streams() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub).await;
    let (bob, mut bob_events) = node(&hub).await;
    let app = AppId::from_name("node-tests");

    let set_a = make_set(
        &alice,
        OperationType::Intersection,
        vec![element("x"), element("y")],
    )
    .await;
    let set_b = make_set(
        &bob,
        OperationType::Intersection,
        vec![element("y"), element("z")],
    )
    .await;
    bob.call(move |svc| svc.listen(OperationType::Intersection, app))
        .await
        .unwrap();

    let to = bob.peer();
    let op_a = alice
        .call(move |svc| {
            svc.evaluate(set_a, to, app, None, ResultMode::Full, OperationOptions::default())
        })
        .await
        .unwrap();
    let request = next_request(&mut bob_events).await;
    let op_b = bob
        .call(move |svc| svc.accept(request, set_b, ResultMode::Full, OperationOptions::default()))
        .await
        .unwrap();

    let (kept_a, status_a) = results_of(&mut alice_events, op_a).await;
    let (kept_b, status_b) = results_of(&mut bob_events, op_b).await;
    assert_eq!(status_a, ResultStatus::Done);
    assert_eq!(status_b, ResultStatus::Done);
    assert_eq!(kept_a, name_set(&["y"]));
    assert_eq!(kept_b, name_set(&["y"]));
}

#[tokio::test]
async fn dialing_an_unknown_peer_fails() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub).await;
    let app = AppId::from_name("node-tests");
    let set = make_set(&alice, OperationType::Union, vec![element("x")]).await;

    let op = alice
        .call(move |svc| {
            svc.evaluate(
                set,
                PeerId::new(),
                app,
                None,
                ResultMode::Added,
                OperationOptions::default(),
            )
        })
        .await
        .unwrap();

    let (added, status) = results_of(&mut alice_events, op).await;
    assert!(added.is_empty());
    assert_eq!(status, ResultStatus::Failure);
    assert_eq!(alice.call(|svc| svc.stats().channels).await, 0);
}

#[tokio::test]
async fn rejected_request_fails_the_initiator() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = node(&hub).await;
    let (bob, mut bob_events) = node(&hub).await;
    let app = AppId::from_name("node-tests");
    let set = make_set(&alice, OperationType::Union, vec![element("x")]).await;
    bob.call(move |svc| svc.listen(OperationType::Union, app))
        .await
        .unwrap();

    let to = bob.peer();
    let op = alice
        .call(move |svc| {
            svc.evaluate(set, to, app, None, ResultMode::Added, OperationOptions::default())
        })
        .await
        .unwrap();
    let request = next_request(&mut bob_events).await;
    bob.call(move |svc| svc.reject(request)).await.unwrap();

    let (_, status) = results_of(&mut alice_events, op).await;
    assert_eq!(status, ResultStatus::Failure);
}

/// Holds every dial until a permit is added.
struct GatedDialer {
    hub: Arc<MemoryHub>,
    started: Notify,
    gate: Semaphore,
}

#[async_trait]
impl Dialer for GatedDialer {
    async fn dial(&self, from: PeerId, to: PeerId) -> ReconResult<DuplexStream> {
        self.started.notify_one();
        self.gate
            .acquire()
            .await
            .map_err(|_| ReconError::PeerUnreachable(to))?
            .forget();
        self.hub.dial(from, to).await
    }
}

#[tokio::test]
async fn slow_dial_does_not_block_the_node() {
    let hub = MemoryHub::new();
    let dialer = Arc::new(GatedDialer {
        hub: hub.clone(),
        started: Notify::new(),
        gate: Semaphore::new(0),
    });
    let service = SetService::new(PeerId::new(), ServiceConfig::default()).unwrap();
    let (alice, mut alice_events) = spawn_with(service, hub.clone(), dialer.clone()).await;
    let (bob, mut bob_events) = node(&hub).await;
    let app = AppId::from_name("node-tests");

    let set_a = make_set(&alice, OperationType::Union, vec![element("x")]).await;
    let set_b = make_set(&bob, OperationType::Union, vec![element("y")]).await;
    bob.call(move |svc| svc.listen(OperationType::Union, app))
        .await
        .unwrap();

    let to = bob.peer();
    let caller = alice.clone();
    let evaluating = tokio::spawn(async move {
        caller
            .call(move |svc| {
                svc.evaluate(set_a, to, app, None, ResultMode::Added, OperationOptions::default())
            })
            .await
    });
    timeout(WAIT, dialer.started.notified())
        .await
        .expect("dial never started");

    // The dial is parked; the node must still serve other calls.
    let operations = timeout(WAIT, alice.call(|svc| svc.stats().operations))
        .await
        .expect("node blocked by a pending dial");
    assert_eq!(operations, 1);

    dialer.gate.add_permits(1);
    let op_a = evaluating.await.unwrap().unwrap();
    let request = next_request(&mut bob_events).await;
    let op_b = bob
        .call(move |svc| {
            svc.accept(request, set_b, ResultMode::Added, OperationOptions::default())
        })
        .await
        .unwrap();

    let (added_a, status_a) = results_of(&mut alice_events, op_a).await;
    let (added_b, status_b) = results_of(&mut bob_events, op_b).await;
    assert_eq!(status_a, ResultStatus::Done);
    assert_eq!(status_b, ResultStatus::Done);
    assert_eq!(added_a, name_set(&["y"]));
    assert_eq!(added_b, name_set(&["x"]));
}

