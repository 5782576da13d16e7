use crate::error::Error;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

/// A boxed single-shot deferred leaf.
pub type NodeFuture = BoxFuture<'static, Result<Node, Error>>;

/// A boxed lazy sequence leaf.
pub type NodeStream = BoxStream<'static, Result<Node, Error>>;

/// A JSON-compatible value tree whose leaves may be deferred.
///
/// `Node` is both the producer's input and the consumer's output: a future
/// delivered by rehydration resolves to another `Node`, so nested deferred
/// values compose without a second type.
///
/// Containers (`Array`/`Object`) may hold deferred values as *direct*
/// entries.  A `Value` subtree is opaque to the codec and passes through
/// untouched.
pub enum Node {
    /// A plain JSON subtree.
    Value(Value),
    /// An array whose direct entries may be deferred.
    Array(Vec<Node>),
    /// A mapping whose direct entries may be deferred.
    Object(BTreeMap<String, Node>),
    /// A single-shot future leaf.
    Promise(NodeFuture),
    /// A lazy sequence leaf.
    Stream(NodeStream),
}

impl Node {
    /// A future leaf from any compatible future.
    pub fn promise<F>(future: F) -> Self
    where
        F: Future<Output = Result<Node, Error>> + Send + 'static,
    {
        Node::Promise(Box::pin(future))
    }

    /// A future leaf that is already fulfilled.
    pub fn resolved(value: impl Into<Node>) -> Self {
        let node = value.into();
        Node::Promise(Box::pin(futures::future::ready(Ok(node))))
    }

    /// A future leaf that is already rejected.
    pub fn rejected(err: Error) -> Self {
        Node::Promise(Box::pin(futures::future::ready(Err(err))))
    }

    /// A sequence leaf from any compatible stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Node, Error>> + Send + 'static,
    {
        Node::Stream(Box::pin(stream))
    }

    /// A sequence leaf that yields the given items and then completes.
    pub fn stream_of<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Node>,
    {
        let items: Vec<Result<Node, Error>> =
            items.into_iter().map(|item| Ok(item.into())).collect();
        Node::stream(futures::stream::iter(items))
    }

    /// A mapping from key/node pairs.
    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Node)>,
        K: Into<String>,
    {
        Node::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// An array from nodes.
    pub fn array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Node>,
    {
        Node::Array(items.into_iter().map(Into::into).collect())
    }

    /// True for future and sequence leaves.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Node::Promise(_) | Node::Stream(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Node::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow a mapping entry.
    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Take a mapping entry out, e.g. to await a deferred leaf.
    pub fn remove(&mut self, key: &str) -> Option<Node> {
        match self {
            Node::Object(map) => map.remove(key),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<BTreeMap<String, Node>> {
        match self {
            Node::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Node>> {
        match self {
            Node::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_future(self) -> Option<NodeFuture> {
        match self {
            Node::Promise(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<NodeStream> {
        match self {
            Node::Stream(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Value> for Node {
    fn from(v: Value) -> Self {
        Node::Value(v)
    }
}

impl From<&str> for Node {
    fn from(v: &str) -> Self {
        Node::Value(Value::from(v))
    }
}

impl From<String> for Node {
    fn from(v: String) -> Self {
        Node::Value(Value::from(v))
    }
}

impl From<bool> for Node {
    fn from(v: bool) -> Self {
        Node::Value(Value::from(v))
    }
}

impl From<i64> for Node {
    fn from(v: i64) -> Self {
        Node::Value(Value::from(v))
    }
}

impl From<u64> for Node {
    fn from(v: u64) -> Self {
        Node::Value(Value::from(v))
    }
}

impl From<f64> for Node {
    fn from(v: f64) -> Self {
        Node::Value(Value::from(v))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Node::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Node::Object(map) => f.debug_tuple("Object").field(map).finish(),
            Node::Promise(_) => f.write_str("Promise(..)"),
            Node::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
