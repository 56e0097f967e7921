mod common;

use common::{element, elements, name_set, names, reconcile, Inbound, Pair};
use pretty_assertions::assert_eq;
use setrecon_service::protocol::BloomFilterMessage;
use setrecon_service::{
    ChannelAction, OperationOptions, ReconError, ReconMessage, ResultMode, ResultStatus,
    ServiceConfig,
};
use setrecon_sketch::filter_size_bytes;
use setrecon_types::{Element, ElementHash, OperationType};
use std::time::{Duration, Instant};

fn numbered(prefix: &str, count: usize) -> Vec<Element> {
    (0..count).map(|i| element(&format!("{prefix}-{i}"))).collect()
}

fn joined(a: &[Element], b: &[Element]) -> Vec<Element> {
    a.iter().chain(b).cloned().collect()
}

// ── Small sets ──────────────────────────────────────────────────

#[test]
fn full_mode_reports_the_common_elements() {
    let run = reconcile(
        OperationType::Intersection,
        &elements(&["x", "y"]),
        &elements(&["y", "z"]),
        ResultMode::Full,
        OperationOptions::default(),
    );

    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
    assert_eq!(run.a.with_status(ResultStatus::Added), name_set(&["y"]));
    assert_eq!(run.b.with_status(ResultStatus::Added), name_set(&["y"]));
}

#[test]
fn removed_mode_reports_dropped_local_elements() {
    let run = reconcile(
        OperationType::Intersection,
        &elements(&["x", "y"]),
        &elements(&["y", "z"]),
        ResultMode::Removed,
        OperationOptions::default(),
    );

    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
    assert_eq!(run.a.with_status(ResultStatus::RemovedLocal), name_set(&["x"]));
    assert_eq!(run.b.with_status(ResultStatus::RemovedLocal), name_set(&["z"]));
    assert!(run.a.with_status(ResultStatus::Added).is_empty());
}

#[test]
fn identical_sets_keep_everything() {
    let items = numbered("same", 40);
    let run = reconcile(
        OperationType::Intersection,
        &items,
        &items,
        ResultMode::Full,
        OperationOptions::default(),
    );

    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
    assert_eq!(run.a.with_status(ResultStatus::Added), names(&items));
    assert_eq!(run.b.with_status(ResultStatus::Added), names(&items));
}

#[test]
fn disjoint_sets_end_empty() {
    let only_a = numbered("a", 20);
    let only_b = numbered("b", 20);
    let run = reconcile(
        OperationType::Intersection,
        &only_a,
        &only_b,
        ResultMode::Removed,
        OperationOptions::default(),
    );

    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
    assert_eq!(run.a.with_status(ResultStatus::RemovedLocal), names(&only_a));
    assert_eq!(run.b.with_status(ResultStatus::RemovedLocal), names(&only_b));
}

// ── Empty sides ─────────────────────────────────────────────────

#[test]
fn empty_initiator_empties_the_acceptor() {
    let run = reconcile(
        OperationType::Intersection,
        &[],
        &elements(&["x", "w"]),
        ResultMode::Removed,
        OperationOptions::default(),
    );

    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
    assert!(run.a.results.is_empty());
    assert_eq!(run.b.with_status(ResultStatus::RemovedLocal), name_set(&["w", "x"]));
}

#[test]
fn empty_acceptor_empties_the_initiator() {
    let run = reconcile(
        OperationType::Intersection,
        &elements(&["x", "w"]),
        &[],
        ResultMode::Removed,
        OperationOptions::default(),
    );

    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
    assert_eq!(run.a.with_status(ResultStatus::RemovedLocal), name_set(&["w", "x"]));
    assert!(run.b.results.is_empty());
}

#[test]
fn both_empty_completes() {
    let run = reconcile(
        OperationType::Intersection,
        &[],
        &[],
        ResultMode::Full,
        OperationOptions::default(),
    );
    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
}

// ── Larger sets ─────────────────────────────────────────────────

#[test]
fn larger_sets_converge_on_the_exact_intersection() {
    let shared = numbered("shared", 500);
    let only_a = numbered("a", 100);
    let only_b = numbered("b", 100);

    let run = reconcile(
        OperationType::Intersection,
        &joined(&shared, &only_a),
        &joined(&shared, &only_b),
        ResultMode::Full,
        OperationOptions::default(),
    );

    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
    assert_eq!(run.a.with_status(ResultStatus::Added), names(&shared));
    assert_eq!(run.b.with_status(ResultStatus::Added), names(&shared));
}

#[test]
fn bigger_acceptor_announces_its_count_first() {
    let shared = numbered("shared", 10);
    let extra = numbered("extra", 90);

    let run = reconcile(
        OperationType::Intersection,
        &shared,
        &joined(&shared, &extra),
        ResultMode::Removed,
        OperationOptions::default(),
    );

    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
    assert!(run.a.results.is_empty());
    assert_eq!(run.b.with_status(ResultStatus::RemovedLocal), names(&extra));
}

#[test]
fn bigger_initiator_is_reduced_by_the_acceptor_filter() {
    let shared = numbered("shared", 10);
    let extra = numbered("extra", 90);

    let run = reconcile(
        OperationType::Intersection,
        &joined(&shared, &extra),
        &shared,
        ResultMode::Symmetric,
        OperationOptions::default(),
    );

    assert!(run.a.succeeded());
    assert!(run.b.succeeded());
    assert_eq!(run.a.with_status(ResultStatus::RemovedLocal), names(&extra));
    assert!(run.b.results.is_empty());
}

#[test]
fn intersection_leaves_the_stored_set_untouched() {
    let run = reconcile(
        OperationType::Intersection,
        &elements(&["x", "y"]),
        &elements(&["y", "z"]),
        ResultMode::Removed,
        OperationOptions::default(),
    );
    let mut pair = run.pair;
    let a = pair.a;
    assert_eq!(pair.svc(a).element_count(run.set_a).unwrap(), 2);
    assert!(pair.svc(a).contains(run.set_a, &element("x").hash()).unwrap());
    assert_eq!(pair.svc(a).stats().operations, 0);
    assert_eq!(pair.svc(a).stats().channels, 0);
}

#[test]
fn union_set_cannot_accept_an_intersection_request() {
    let mut pair = Pair::new();
    let (a, b, app) = (pair.a, pair.b, pair.app);
    let set_a = pair.set_with(a, OperationType::Intersection, &elements(&["x"]));
    let union_set = pair.set_with(b, OperationType::Union, &elements(&["x"]));
    pair.svc(b).listen(OperationType::Intersection, app).unwrap();

    pair.svc(a)
        .evaluate(set_a, b, app, None, ResultMode::Full, OperationOptions::default())
        .unwrap();
    pair.run();
    let request = pair.requests(b)[0];

    let err = pair
        .svc(b)
        .accept(request, union_set, ResultMode::Full, OperationOptions::default())
        .unwrap_err();
    match err {
        ReconError::OperationTypeMismatch { expected, actual } => {
            assert_eq!(expected, OperationType::Intersection);
            assert_eq!(actual, OperationType::Union);
        }
        other => panic!("expected OperationTypeMismatch, got {:?}", other),
    }
    // The request survives a failed accept.
    assert_eq!(pair.svc(b).stats().incoming_requests, 1);
}

// ── Hostile filters ─────────────────────────────────────────────

fn filter(sender_element_count: u64, total_len: u32, bits_per_element: u32) -> ReconMessage {
    ReconMessage::BloomFilter(BloomFilterMessage {
        sender_element_count,
        element_xor_hash: ElementHash::ZERO,
        salt: 7,
        total_len,
        bits_per_element,
        chunk: vec![0xff],
    })
}

fn assert_rejected(mut inbound: Inbound, message: ReconMessage) {
    let started = Instant::now();
    let out = inbound.deliver(message);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(out.terminal, vec![ResultStatus::Failure]);
    assert!(out.results.is_empty());
    assert_eq!(
        inbound.svc.take_actions(),
        vec![ChannelAction::Close {
            channel: inbound.channel
        }]
    );
    assert_eq!(inbound.svc.stats().operations, 0);
}

fn acceptor() -> Inbound {
    Inbound::accept(
        OperationType::Intersection,
        &numbered("e", 4),
        8,
        ResultMode::Full,
    )
}

#[test]
fn oversized_hash_count_is_rejected() {
    assert_rejected(acceptor(), filter(8, 1, 20_000_000));
}

#[test]
fn hash_count_above_the_configured_cap_is_rejected() {
    let cap = ServiceConfig::default().max_bloom_bits_per_element;
    let len = filter_size_bytes(8, cap + 1) as u32;
    assert_rejected(acceptor(), filter(8, len, cap + 1));
}

#[test]
fn filter_length_must_match_its_element_count() {
    assert_rejected(acceptor(), filter(8, u32::MAX, 4));
    assert_rejected(acceptor(), filter(8, 1, 4));
}

#[test]
fn filter_cannot_cover_more_elements_than_announced() {
    let len = filter_size_bytes(9, 4) as u32;
    assert_rejected(acceptor(), filter(9, len, 4));
}

#[test]
fn well_formed_partial_filter_is_buffered() {
    let mut inbound = acceptor();
    let len = filter_size_bytes(8, 4) as u32;
    assert!(len > 1);
    let out = inbound.deliver(filter(8, len, 4));
    assert!(out.terminal.is_empty());
    assert!(inbound.svc.take_actions().is_empty());
    assert_eq!(inbound.svc.stats().operations, 1);
}

