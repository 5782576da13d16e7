use driplines::{Controller, Deferred, Error, Node, controlled};

/// A promise leaf settled from the outside: resolve or reject the returned
/// [`Deferred`] whenever the test scenario calls for it.
pub fn deferred_node() -> (Deferred<Node>, Node) {
    let (deferred, pending) = Deferred::new();
    (deferred, Node::promise(pending))
}

/// A sequence leaf driven from the outside via its [`Controller`].
pub fn controlled_node() -> (Controller<Node>, Node) {
    let (controller, stream) = controlled();
    (controller, Node::stream(stream))
}

/// A sequence leaf that fails after yielding the given items.
pub fn failing_stream_node(items: Vec<Node>, err: Error) -> Node {
    let (controller, stream) = controlled();
    for item in items {
        controller.enqueue(item);
    }
    controller.fail(err);
    Node::stream(stream)
}
