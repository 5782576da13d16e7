//! Wire-discipline invariants on emitted streams, and consumer reassembly
//! from hand-built streams with adversarial but legal interleavings.
//!
//! # Coverage
//! - Exactly one head line, and it is the first line.
//! - Chunk-id allocation is strictly increasing from 0.
//! - Exactly one terminal event per allocated id.
//! - Cross-id interleaving is reassembled onto the right keys.
//! - A chunk observed before its id is referenced holds the writer until
//!   rehydration catches up.
//! - Reader-style adapters (`into_reader` / `consume_reader`) round trip.

use driplines::{ConsumeOptions, Node, ProduceOptions, consume, produce};
use dl_test_utils::{byte_pipe, collect_lines};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::time::{Duration, timeout};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn mixed_tree() -> Node {
    Node::object([
        ("a", Node::resolved(1i64)),
        ("b", Node::stream_of([10i64, 20])),
        ("c", Node::resolved(3i64)),
    ])
}

/// Collect every descriptor `[key, kind, id]` triple reachable from a head
/// line, in key order.
fn head_descriptor_ids(head: &Value) -> Vec<u64> {
    let mut ids = Vec::new();
    for dehydrated in head.as_object().expect("head object").values() {
        let parts = dehydrated.as_array().expect("dehydrated array");
        for descriptor in &parts[1..] {
            let triple = descriptor.as_array().expect("descriptor triple");
            ids.push(triple[2].as_u64().expect("id"));
        }
    }
    ids
}

// ---------------------------------------------------------------------------
// Producer-side invariants
// ---------------------------------------------------------------------------

/// The first line is the only line that parses as a JSON object.
#[tokio::test]
async fn head_is_first_and_only() {
    let produced = produce(mixed_tree(), ProduceOptions::default()).expect("valid root");
    let lines = collect_lines(produced).await;
    assert!(lines[0].starts_with('{'), "head first");
    for chunk in &lines[1..] {
        let value: Value = serde_json::from_str(chunk).expect("chunk json");
        assert!(value.is_array(), "chunks are arrays: {chunk}");
    }
}

/// Allocation follows root key order, counting up from 0 without gaps.
#[tokio::test]
async fn ids_allocate_strictly_increasing_from_zero() {
    let produced = produce(mixed_tree(), ProduceOptions::default()).expect("valid root");
    let lines = collect_lines(produced).await;
    let head: Value = serde_json::from_str(&lines[0]).expect("head json");
    assert_eq!(head_descriptor_ids(&head), vec![0, 1, 2]);
}

/// Nested dehydration keeps allocating above every id handed out so far.
#[tokio::test]
async fn nested_ids_extend_the_counter() {
    let data = Node::object([
        ("outer", Node::promise(async { Ok(Node::object([("inner", Node::resolved(1i64))])) })),
        ("side", Node::resolved(2i64)),
    ]);
    let produced = produce(data, ProduceOptions::default()).expect("valid root");
    let lines = collect_lines(produced).await;
    let mut seen = std::collections::BTreeSet::new();
    for chunk in &lines[1..] {
        let value: Value = serde_json::from_str(chunk).expect("chunk json");
        let parts = value.as_array().expect("frame");
        seen.insert(parts[0].as_u64().expect("id"));
        if let Some(body) = parts.get(2).and_then(Value::as_array) {
            for descriptor in &body[1..] {
                let triple = descriptor.as_array().expect("descriptor triple");
                let nested = triple[2].as_u64().expect("id");
                assert_eq!(nested, 2, "fresh id above the head's 0 and 1");
            }
        }
    }
    let expected: std::collections::BTreeSet<u64> = [0, 1, 2].into_iter().collect();
    assert_eq!(seen, expected);
}

/// Every id gets exactly one terminal event: a promise settles once, a
/// sequence ends once after its values.
#[tokio::test]
async fn exactly_one_terminal_per_id() {
    let produced = produce(mixed_tree(), ProduceOptions::default()).expect("valid root");
    let lines = collect_lines(produced).await;
    let head: Value = serde_json::from_str(&lines[0]).expect("head json");

    // kind per id, from the head descriptors.
    let mut kinds = std::collections::HashMap::new();
    for dehydrated in head.as_object().expect("head").values() {
        let parts = dehydrated.as_array().expect("dehydrated");
        for descriptor in &parts[1..] {
            let triple = descriptor.as_array().expect("triple");
            kinds.insert(triple[2].as_u64().expect("id"), triple[1].as_u64().expect("kind"));
        }
    }

    let mut terminals = std::collections::HashMap::new();
    for chunk in &lines[1..] {
        let value: Value = serde_json::from_str(chunk).expect("chunk json");
        let parts = value.as_array().expect("frame");
        let id = parts[0].as_u64().expect("id");
        let status = parts[1].as_u64().expect("status");
        let terminal = match kinds[&id] {
            0 => true,          // promises: fulfilled or rejected both terminate
            1 => status != 1,   // sequences: anything but a value chunk
            other => panic!("unknown kind {other}"),
        };
        if terminal {
            *terminals.entry(id).or_insert(0u32) += 1;
        }
    }
    for id in kinds.keys() {
        assert_eq!(terminals.get(id), Some(&1), "id {id} must terminate exactly once");
    }
}

// ---------------------------------------------------------------------------
// Consumer-side reassembly
// ---------------------------------------------------------------------------

/// Chunks interleaved across ids (legal per-id order) land on the right
/// keys regardless of arrival order.
#[tokio::test]
async fn interleaved_ids_reassemble_onto_their_keys() {
    let blob = format!(
        "{}\n{}\n{}\n{}\n{}\n",
        r#"{"a":[[0],[null,0,0]],"xs":[[0],[null,1,1]]}"#,
        "[1,1,[[10]]]",
        "[0,0,[[5]]]",
        "[1,1,[[20]]]",
        "[1,0]",
    );
    let mut consumer = consume(dl_test_utils::chunked(blob, 11), ConsumeOptions::default());
    let mut head = timeout(Duration::from_secs(2), consumer.head())
        .await
        .expect("head arrives")
        .expect("head ok");

    let a = head.remove("a").expect("a").into_future().expect("promise leaf");
    let mut xs = head.remove("xs").expect("xs").into_stream().expect("sequence leaf");

    let mut seen = Vec::new();
    while let Some(item) = timeout(Duration::from_secs(2), xs.next()).await.expect("item") {
        seen.push(item.expect("value").as_value().cloned().expect("plain"));
    }
    assert_eq!(seen, vec![json!(10), json!(20)]);
    assert_eq!(a.await.expect("a resolves").as_value(), Some(&json!(5)));
}

/// A chunk for an id introduced inside another chunk's payload arrives
/// before anyone hydrates that payload.  The driver parks on it and
/// delivery completes once the outer future is awaited.
#[tokio::test]
async fn chunk_before_reference_delivers_after_hydration() {
    dl_test_utils::init_tracing();
    let (tx, rx) = byte_pipe();
    let mut consumer = consume(rx, ConsumeOptions::default());
    tx.send_line(r#"{"x":[[0],[null,0,0]]}"#).await;
    tx.send_line(r#"[0,0,[[{"y":0}],["y",0,1]]]"#).await;
    tx.send_line("[1,0,[[9]]]").await;

    let mut head = timeout(Duration::from_secs(2), consumer.head())
        .await
        .expect("head arrives")
        .expect("head ok");
    let x = head.remove("x").expect("x").into_future().expect("promise leaf");
    let mut outer = timeout(Duration::from_secs(2), x)
        .await
        .expect("outer settles")
        .expect("fulfilled");
    let y = outer.remove("y").expect("y").into_future().expect("inner promise leaf");
    let inner = timeout(Duration::from_secs(2), y)
        .await
        .expect("inner settles")
        .expect("fulfilled");
    assert_eq!(inner.as_value(), Some(&json!(9)));
    tx.cut();
}

/// While an unknown-id chunk is parked, later known-id chunks are *not*
/// delivered — the writer is genuinely held back, not buffered around.
#[tokio::test]
async fn parked_chunk_holds_back_later_chunks() {
    dl_test_utils::init_tracing();
    let (tx, rx) = byte_pipe();
    let mut consumer = consume(rx, ConsumeOptions::default());
    tx.send_line(r#"{"a":[[0],[null,0,0]]}"#).await;
    tx.send_line("[5,0,[[1]]]").await; // never referenced
    tx.send_line("[0,0,[[2]]]").await; // a's chunk, stuck behind the parked one

    let mut head = timeout(Duration::from_secs(2), consumer.head())
        .await
        .expect("head arrives")
        .expect("head ok");
    let a = head.remove("a").expect("a").into_future().expect("promise leaf");
    let stalled = timeout(Duration::from_millis(300), a).await;
    assert!(stalled.is_err(), "a must not resolve while the writer is parked");
    consumer.abort();
}

// ---------------------------------------------------------------------------
// Reader adapters
// ---------------------------------------------------------------------------

/// `Produced::into_reader` piped into `consume_reader` is a full round trip
/// through the `AsyncRead` interfaces.
#[tokio::test]
async fn reader_adapters_round_trip() {
    let data = Node::object([("x", Node::resolved(41i64)), ("tag", Node::from("r"))]);
    let produced = produce(data, ProduceOptions::default()).expect("valid root");
    let mut consumer = driplines::consume_reader(produced.into_reader(), ConsumeOptions::default());

    let mut head = timeout(Duration::from_secs(2), consumer.head())
        .await
        .expect("head arrives")
        .expect("head ok");
    assert_eq!(head["tag"].as_value(), Some(&json!("r")));
    let x = head.remove("x").expect("x").into_future().expect("promise leaf");
    let resolved = timeout(Duration::from_secs(2), x)
        .await
        .expect("settles")
        .expect("fulfilled");
    assert_eq!(resolved.as_value(), Some(&json!(41)));
}
