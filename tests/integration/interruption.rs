//! Interruption protocol: transport cuts, transport errors, local abort,
//! and producer-side cancellation.
//!
//! # Coverage
//! - Cut before head: the head future itself rejects.
//! - Cut mid-flight: every unresolved promise rejects, every unterminated
//!   sequence throws on its next iteration.
//! - Values delivered before the cut stay delivered.
//! - Transport errors behave like cuts and reach the `on_error` observer.
//! - `Consumer::abort` triggers the same teardown locally.
//! - References hydrated after interruption observe only the interruption.
//! - Dropping the produced stream cancels in-flight user work.

use driplines::{ConsumeOptions, Node, ProduceOptions, consume, produce};
use dl_test_utils::{byte_pipe, controlled_node, deferred_node, pump_lines};
use futures::StreamExt;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, timeout};

async fn await_head(consumer: &mut driplines::Consumer) -> driplines::Head {
    timeout(Duration::from_secs(2), consumer.head())
        .await
        .expect("head should arrive")
        .expect("head should resolve")
}

/// Cutting the stream before the head line rejects the head future.
#[tokio::test]
async fn cut_before_head_rejects_the_head() {
    let (tx, rx) = byte_pipe();
    let mut consumer = consume(rx, ConsumeOptions::default());
    tx.cut();
    let err = timeout(Duration::from_secs(2), consumer.head())
        .await
        .expect("head settles")
        .expect_err("head rejected");
    assert!(err.is_interrupted());
}

/// Cutting after the head interrupts every unresolved leaf.
#[tokio::test]
async fn cut_after_head_interrupts_all_unresolved_leaves() {
    dl_test_utils::init_tracing();
    let (tx, rx) = byte_pipe();
    let mut consumer = consume(rx, ConsumeOptions::default());
    tx.send_line(r#"{"x":[[0],[null,0,0]],"xs":[[0],[null,1,1]]}"#).await;
    let mut head = await_head(&mut consumer).await;
    tx.cut();

    let x = head.remove("x").expect("x").into_future().expect("promise leaf");
    let err = timeout(Duration::from_secs(2), x)
        .await
        .expect("settles")
        .expect_err("interrupted");
    assert!(err.is_interrupted());

    let mut xs = head.remove("xs").expect("xs").into_stream().expect("sequence leaf");
    let first = timeout(Duration::from_secs(2), xs.next())
        .await
        .expect("one event")
        .expect("an item");
    assert!(first.expect_err("interrupted").is_interrupted());
    assert!(xs.next().await.is_none(), "sequence terminates after the interruption");
}

/// A value delivered before the cut survives; only the tail is interrupted.
#[tokio::test]
async fn delivered_values_survive_a_cut() {
    let (tx, rx) = byte_pipe();
    let mut consumer = consume(rx, ConsumeOptions::default());
    tx.send_line(r#"{"xs":[[0],[null,1,0]]}"#).await;
    tx.send_line("[0,1,[[1]]]").await;
    let mut head = await_head(&mut consumer).await;
    let mut xs = head.remove("xs").expect("xs").into_stream().expect("sequence leaf");

    let first = timeout(Duration::from_secs(2), xs.next())
        .await
        .expect("first item")
        .expect("an item")
        .expect("a value");
    assert_eq!(first.as_value(), Some(&json!(1)));

    tx.cut();
    let second = timeout(Duration::from_secs(2), xs.next())
        .await
        .expect("second event")
        .expect("an item");
    assert!(second.expect_err("interrupted").is_interrupted());
}

/// A transport error tears down like a cut and reaches `on_error`.
#[tokio::test]
async fn transport_error_interrupts_and_is_observed() {
    let observed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let opts = ConsumeOptions {
        on_error: Some(Arc::new(move |err| {
            sink.lock().expect("observer mutex").push(err.to_string());
        })),
        ..ConsumeOptions::default()
    };

    let (tx, rx) = byte_pipe();
    let mut consumer = consume(rx, opts);
    tx.send_line(r#"{"x":[[0],[null,0,0]]}"#).await;
    let mut head = await_head(&mut consumer).await;
    tx.fail(std::io::Error::other("wire down")).await;

    let x = head.remove("x").expect("x").into_future().expect("promise leaf");
    let err = timeout(Duration::from_secs(2), x)
        .await
        .expect("settles")
        .expect_err("interrupted");
    assert!(err.is_interrupted());

    let seen = observed.lock().expect("observer mutex");
    assert!(
        seen.iter().any(|msg| msg.contains("wire down")),
        "observer should see the transport error, got {seen:?}"
    );
}

/// Local abort produces the same teardown as a remote cut.
#[tokio::test]
async fn abort_interrupts_locally() {
    let (tx, rx) = byte_pipe();
    let mut consumer = consume(rx, ConsumeOptions::default());
    tx.send_line(r#"{"x":[[0],[null,0,0]]}"#).await;
    let mut head = await_head(&mut consumer).await;

    consumer.abort();
    let x = head.remove("x").expect("x").into_future().expect("promise leaf");
    let err = timeout(Duration::from_secs(2), x)
        .await
        .expect("settles")
        .expect_err("interrupted");
    assert!(err.is_interrupted());
    drop(tx);
}

/// An id referenced only after interruption still observes the
/// interruption: the outer promise resolved before the cut, its nested leaf
/// is hydrated after.
#[tokio::test]
async fn reference_after_interruption_is_interrupted() {
    let (tx, rx) = byte_pipe();
    let mut consumer = consume(rx, ConsumeOptions::default());
    tx.send_line(r#"{"x":[[0],[null,0,0]]}"#).await;
    tx.send_line(r#"[0,0,[[{"y":0}],["y",0,1]]]"#).await;
    let mut head = await_head(&mut consumer).await;
    tx.cut();
    // Let the driver drain the remaining line and observe the cut.
    tokio::task::yield_now().await;

    let x = head.remove("x").expect("x").into_future().expect("promise leaf");
    let mut outer = timeout(Duration::from_secs(2), x)
        .await
        .expect("outer settles")
        .expect("outer was delivered before the cut");
    let y = outer.remove("y").expect("y").into_future().expect("inner promise leaf");
    let err = timeout(Duration::from_secs(2), y)
        .await
        .expect("inner settles")
        .expect_err("interrupted");
    assert!(err.is_interrupted());
}

/// Cutting a real produced stream mid-flight: only the head and the first
/// value chunk cross the wire, then the transport goes away under both
/// sides at once.
#[tokio::test]
async fn produced_stream_cut_mid_flight() {
    let (controller, xs) = controlled_node();
    let mut produced = produce(
        Node::object([("xs", xs)]),
        ProduceOptions::default(),
    )
    .expect("valid root");
    controller.enqueue(Node::from(1i64));

    let (tx, rx) = byte_pipe();
    let mut consumer = consume(rx, ConsumeOptions::default());
    let forwarded = pump_lines(&mut produced, &tx, 2).await;
    assert_eq!(forwarded, 2, "head plus one value chunk");
    tx.cut();
    drop(produced);

    let mut head = await_head(&mut consumer).await;
    let mut xs = head.remove("xs").expect("xs").into_stream().expect("sequence leaf");
    let first = timeout(Duration::from_secs(2), xs.next())
        .await
        .expect("first item")
        .expect("an item")
        .expect("a value");
    assert_eq!(first.as_value(), Some(&json!(1)));
    let second = timeout(Duration::from_secs(2), xs.next())
        .await
        .expect("second event")
        .expect("an item");
    assert!(second.expect_err("interrupted").is_interrupted());
}

/// Dropping the produced stream cancels an in-flight user sequence: its
/// controller sees the consumer go away instead of leaking work.
#[tokio::test]
async fn dropping_produced_cancels_user_sequences() {
    let (controller, xs) = controlled_node();
    let mut produced = produce(
        Node::object([("xs", xs)]),
        ProduceOptions::default(),
    )
    .expect("valid root");

    let head = produced.next().await.expect("head").expect("ok");
    assert!(head.starts_with(b"{"));
    controller.enqueue(Node::from(1i64));
    let chunk = produced.next().await.expect("value chunk").expect("ok");
    assert_eq!(std::str::from_utf8(&chunk).expect("utf8").trim_end(), "[0,1,[[1]]]");

    drop(produced);
    timeout(Duration::from_secs(2), controller.cancelled())
        .await
        .expect("producer should drop the sequence on cancellation");
    assert!(controller.is_cancelled());
}

/// Dropping the produced stream also abandons pending promises; resolving
/// one afterwards is a no-op rather than a panic or a stray emission.
#[tokio::test]
async fn dropping_produced_abandons_pending_promises() {
    let (slow, x) = deferred_node();
    let mut produced = produce(
        Node::object([("x", x)]),
        ProduceOptions::default(),
    )
    .expect("valid root");
    let head = produced.next().await.expect("head").expect("ok");
    assert!(head.starts_with(b"{"));

    drop(produced);
    // Give the leaf task a moment to observe the cancellation.
    tokio::time::sleep(Duration::from_millis(20)).await;
    slow.resolve(Node::from(1i64));
}
