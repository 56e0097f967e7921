//! Shared test helpers for service tests.

#![allow(dead_code)]

use setrecon_service::protocol::OperationRequestMessage;
use setrecon_service::{
    ChannelId, ClientEvent, MemoryNetwork, OperationId, OperationOptions, ReconMessage,
    RequestId, ResultMode, ResultStatus, ServiceConfig, SetId, SetService,
};
use setrecon_types::{AppId, Element, OperationType, PeerId};
use std::collections::BTreeSet;
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn element(s: &str) -> Element {
    Element::from_bytes(s.as_bytes().to_vec())
}

pub fn elements(items: &[&str]) -> Vec<Element> {
    items.iter().map(|s| element(s)).collect()
}

/// Payloads as strings, sorted, for readable set comparisons.
pub fn names<'a>(items: impl IntoIterator<Item = &'a Element>) -> BTreeSet<String> {
    items
        .into_iter()
        .map(|e| String::from_utf8_lossy(&e.data).into_owned())
        .collect()
}

pub fn name_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Two peers on an in-memory network.
pub struct Pair {
    pub net: MemoryNetwork,
    pub a: PeerId,
    pub b: PeerId,
    pub app: AppId,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        init_tracing();
        let mut net = MemoryNetwork::new();
        let a = net.add_peer(SetService::new(PeerId::new(), config.clone()).unwrap());
        let b = net.add_peer(SetService::new(PeerId::new(), config).unwrap());
        Self {
            net,
            a,
            b,
            app: AppId::from_name("setrecon-tests"),
        }
    }

    pub fn svc(&mut self, peer: PeerId) -> &mut SetService {
        self.net.service_mut(peer).expect("peer is on the network")
    }

    pub fn set_with(&mut self, peer: PeerId, op_type: OperationType, items: &[Element]) -> SetId {
        let svc = self.svc(peer);
        let set = svc.create_set(op_type);
        for e in items {
            svc.add_element(set, e.clone()).unwrap();
        }
        set
    }

    pub fn run(&mut self) {
        self.net.run().unwrap();
    }

    /// Request ids of the pending `Request` events of `peer`. Other events
    /// are dropped.
    pub fn requests(&mut self, peer: PeerId) -> Vec<RequestId> {
        self.svc(peer)
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::Request { request, .. } => Some(request),
                _ => None,
            })
            .collect()
    }
}

/// What one side of an operation reported.
#[derive(Debug, Default)]
pub struct Outcome {
    pub results: Vec<(Element, ResultStatus)>,
    pub terminal: Vec<ResultStatus>,
}

impl Outcome {
    pub fn collect(events: &[ClientEvent], op: OperationId) -> Self {
        let mut out = Outcome::default();
        for event in events {
            if let ClientEvent::Result {
                operation,
                element,
                status,
            } = event
            {
                if *operation != op {
                    continue;
                }
                match element {
                    Some(e) => out.results.push((e.clone(), *status)),
                    None => out.terminal.push(*status),
                }
            }
        }
        out
    }

    pub fn with_status(&self, status: ResultStatus) -> BTreeSet<String> {
        names(
            self.results
                .iter()
                .filter(|(_, s)| *s == status)
                .map(|(e, _)| e),
        )
    }

    pub fn succeeded(&self) -> bool {
        self.terminal == vec![ResultStatus::Done]
    }
}

/// Runs one operation between fresh sets on A (initiator) and B (acceptor).
pub struct Run {
    pub pair: Pair,
    pub set_a: SetId,
    pub set_b: SetId,
    pub op_a: OperationId,
    pub op_b: OperationId,
    pub a: Outcome,
    pub b: Outcome,
}

pub fn reconcile(
    op_type: OperationType,
    items_a: &[Element],
    items_b: &[Element],
    mode: ResultMode,
    options: OperationOptions,
) -> Run {
    reconcile_with(Pair::new(), op_type, items_a, items_b, mode, options)
}

pub fn reconcile_with(
    mut pair: Pair,
    op_type: OperationType,
    items_a: &[Element],
    items_b: &[Element],
    mode: ResultMode,
    options: OperationOptions,
) -> Run {
    let (a, b, app) = (pair.a, pair.b, pair.app);
    let set_a = pair.set_with(a, op_type, items_a);
    let set_b = pair.set_with(b, op_type, items_b);
    pair.svc(b).listen(op_type, app).unwrap();

    let op_a = pair
        .svc(a)
        .evaluate(set_a, b, app, None, mode, options)
        .unwrap();
    pair.run();

    let requests = pair.requests(b);
    assert_eq!(requests.len(), 1, "acceptor should see one request");
    let op_b = pair.svc(b).accept(requests[0], set_b, mode, options).unwrap();
    pair.run();

    let events_a = pair.svc(a).take_events();
    let events_b = pair.svc(b).take_events();
    let outcome_a = Outcome::collect(&events_a, op_a);
    let outcome_b = Outcome::collect(&events_b, op_b);
    Run {
        pair,
        set_a,
        set_b,
        op_a,
        op_b,
        a: outcome_a,
        b: outcome_b,
    }
}

/// A service that accepted an inbound operation from a peer announcing
/// `remote_count` elements. The test plays the peer on `channel`; actions
/// emitted by the accept are discarded.
pub struct Inbound {
    pub svc: SetService,
    pub channel: ChannelId,
    pub op: OperationId,
}

impl Inbound {
    pub fn accept(
        op_type: OperationType,
        items: &[Element],
        remote_count: u64,
        mode: ResultMode,
    ) -> Self {
        init_tracing();
        let mut svc = SetService::new(PeerId::new(), ServiceConfig::default()).unwrap();
        let app = AppId::from_name("setrecon-tests");
        let set = svc.create_set(op_type);
        for e in items {
            svc.add_element(set, e.clone()).unwrap();
        }
        svc.listen(op_type, app).unwrap();

        let channel = svc.channel_inbound(PeerId::new());
        svc.handle_message(
            channel,
            ReconMessage::OperationRequest(OperationRequestMessage::new(op_type, app, remote_count)),
        );
        let request = svc
            .take_events()
            .into_iter()
            .find_map(|e| match e {
                ClientEvent::Request { request, .. } => Some(request),
                _ => None,
            })
            .expect("listener sees the request");
        let op = svc
            .accept(request, set, mode, OperationOptions::default())
            .unwrap();
        svc.take_actions();
        Self { svc, channel, op }
    }

    /// Feeds one message from the peer and returns what the client saw.
    pub fn deliver(&mut self, message: ReconMessage) -> Outcome {
        self.svc.handle_message(self.channel, message);
        Outcome::collect(&self.svc.take_events(), self.op)
    }
}
