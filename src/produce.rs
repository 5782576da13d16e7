use crate::error::Error;
use crate::node::{Node, NodeFuture, NodeStream};
use crate::path::Path;
use bytes::Bytes;
use dl_wire::{Dehydrated, Descriptor, Frame, LeafKind, PromiseEvent, SlotKey, StreamEvent};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

/// Applied to the head and every chunk JSON value before line encoding.
pub type SerializeHook = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Observes every deferred-leaf failure with the path it occurred at.
pub type ErrorObserver = Arc<dyn Fn(&Error, &Path) + Send + Sync>;

/// Maps a deferred-leaf failure to its wire payload.
pub type ErrorFormatter = Arc<dyn Fn(&Error, &Path) -> Value + Send + Sync>;

/// Producer-side options.  All hooks are optional; `format_error` defaults
/// to `{"message": <Display>}`.
#[derive(Clone, Default)]
pub struct ProduceOptions {
    pub serialize: Option<SerializeHook>,
    pub on_error: Option<ErrorObserver>,
    pub format_error: Option<ErrorFormatter>,
    /// Cap on deferred-leaf path length.  A leaf beyond the cap still gets
    /// an id, but settles immediately with a max-depth error chunk.
    pub max_depth: Option<usize>,
}

/// Dehydrate a value tree into a line stream: one head line, then one line
/// per chunk as deferred leaves settle.
///
/// The root must be a mapping or an array (array entries become keys `"0"`,
/// `"1"`, …).  Root dehydration runs at first poll, which also spawns one
/// task per deferred leaf — poll the stream inside a Tokio runtime.  The
/// stream ends when the root and every leaf task have finished; dropping it
/// mid-flight cancels all outstanding leaf work.
pub fn produce(data: Node, opts: ProduceOptions) -> Result<Produced, Error> {
    let root: BTreeMap<String, Node> = match data {
        Node::Object(map) => map,
        Node::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, node)| (i.to_string(), node))
            .collect(),
        _ => return Err(Error::InvalidRoot),
    };

    let (chunks, mut rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let dehydrator = Arc::new(Dehydrator {
        chunks,
        cancel,
        next_id: AtomicU64::new(0),
        opts,
    });

    let lines = async_stream::stream! {
        let mut head = BTreeMap::new();
        let mut fault = None;
        for (key, node) in root {
            let path = Path::root().key(key.clone());
            match dehydrator.dehydrate(node, &path) {
                Ok(dehydrated) => {
                    head.insert(key, dehydrated);
                }
                Err(err) => {
                    dehydrator.observe(&err, &path);
                    fault = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = fault {
            // Leaf tasks spawned before the failing entry are abandoned.
            dehydrator.cancel.cancel();
            yield Err(err);
            return;
        }

        let mut head_value = dl_wire::encode_head(&head);
        if let Some(hook) = &dehydrator.opts.serialize {
            head_value = hook(head_value);
        }
        // The dehydrator's chunk sender must go away here: once every leaf
        // task has dropped its clone the channel closes, which is the
        // all-leaves-settled condition ending the stream.
        drop(dehydrator);
        yield encode_line(&head_value);

        while let Some(chunk_value) = rx.recv().await {
            yield encode_line(&chunk_value);
        }
        debug!("all deferred leaves settled; line stream complete");
    };

    Ok(Produced { inner: Box::pin(lines), _cancel: guard })
}

const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// The outgoing line stream.  Dropping it cancels all leaf work.
pub struct Produced {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>,
    _cancel: DropGuard,
}

impl std::fmt::Debug for Produced {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Produced").finish_non_exhaustive()
    }
}

impl Stream for Produced {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Produced {
    /// Adapt the line stream to `AsyncRead` for writer-style transports.
    pub fn into_reader(self) -> impl tokio::io::AsyncRead + Send {
        StreamReader::new(self.map(|item| item.map_err(std::io::Error::other)))
    }
}

fn encode_line(value: &Value) -> Result<Bytes, Error> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(Bytes::from(line))
}

// ---------------------------------------------------------------------------
// Dehydrator
// ---------------------------------------------------------------------------

/// Shared producer state: the chunk channel, the id counter, and the
/// cancellation signal every leaf task races against.
///
/// Leaf tasks each hold an `Arc` of this, so the channel closes exactly
/// when no unsettled leaf remains — a task exiting on any path, panic
/// included, retires its id.
struct Dehydrator {
    chunks: mpsc::Sender<Value>,
    cancel: CancellationToken,
    next_id: AtomicU64,
    opts: ProduceOptions,
}

impl Dehydrator {
    fn alloc(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Replace deferred leaves with placeholders plus descriptors, spawning
    /// a driver task per leaf.  Container inspection is one level deep;
    /// anything further down must be plain JSON.
    fn dehydrate(self: &Arc<Self>, node: Node, path: &Path) -> Result<Dehydrated, Error> {
        match node {
            Node::Promise(future) => {
                let id = self.spawn_promise(future, path.clone());
                Ok(Dehydrated::whole(LeafKind::Promise, id))
            }
            Node::Stream(stream) => {
                let id = self.spawn_stream(stream, path.clone());
                Ok(Dehydrated::whole(LeafKind::Stream, id))
            }
            Node::Value(value) => Ok(Dehydrated::leaf(value)),
            Node::Array(items) => {
                let mut payload = Vec::with_capacity(items.len());
                let mut descriptors = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    let entry_path = path.index(i);
                    match item {
                        Node::Promise(future) => {
                            let id = self.spawn_promise(future, entry_path);
                            payload.push(dl_wire::placeholder());
                            descriptors.push(Descriptor {
                                key: SlotKey::Index(i),
                                kind: LeafKind::Promise,
                                id,
                            });
                        }
                        Node::Stream(stream) => {
                            let id = self.spawn_stream(stream, entry_path);
                            payload.push(dl_wire::placeholder());
                            descriptors.push(Descriptor {
                                key: SlotKey::Index(i),
                                kind: LeafKind::Stream,
                                id,
                            });
                        }
                        other => payload.push(flatten_plain(other, &entry_path)?),
                    }
                }
                Ok(Dehydrated { payload: Value::Array(payload), descriptors })
            }
            Node::Object(map) => {
                let mut payload = Map::new();
                let mut descriptors = Vec::new();
                for (key, entry) in map {
                    let entry_path = path.key(key.clone());
                    match entry {
                        Node::Promise(future) => {
                            let id = self.spawn_promise(future, entry_path);
                            payload.insert(key.clone(), dl_wire::placeholder());
                            descriptors.push(Descriptor {
                                key: SlotKey::Field(key),
                                kind: LeafKind::Promise,
                                id,
                            });
                        }
                        Node::Stream(stream) => {
                            let id = self.spawn_stream(stream, entry_path);
                            payload.insert(key.clone(), dl_wire::placeholder());
                            descriptors.push(Descriptor {
                                key: SlotKey::Field(key),
                                kind: LeafKind::Stream,
                                id,
                            });
                        }
                        other => {
                            payload.insert(key, flatten_plain(other, &entry_path)?);
                        }
                    }
                }
                Ok(Dehydrated { payload: Value::Object(payload), descriptors })
            }
        }
    }

    fn spawn_promise(self: &Arc<Self>, future: NodeFuture, path: Path) -> u64 {
        let id = self.alloc();
        debug!(id, path = %path, "promise leaf registered");
        let this = Arc::clone(self);
        if let Some(err) = self.depth_error(&path) {
            drop(future);
            tokio::spawn(async move {
                this.observe(&err, &path);
                let payload = this.format(&err, &path);
                this.emit(PromiseEvent::Rejected(payload).into_frame(id)).await;
            });
            return id;
        }
        tokio::spawn(this.drive_promise(id, future, path));
        id
    }

    fn spawn_stream(self: &Arc<Self>, stream: NodeStream, path: Path) -> u64 {
        let id = self.alloc();
        debug!(id, path = %path, "sequence leaf registered");
        let this = Arc::clone(self);
        if let Some(err) = self.depth_error(&path) {
            drop(stream);
            tokio::spawn(async move {
                this.observe(&err, &path);
                let payload = this.format(&err, &path);
                this.emit(StreamEvent::Error(payload).into_frame(id)).await;
            });
            return id;
        }
        tokio::spawn(this.drive_stream(id, stream, path));
        id
    }

    /// Await the user future, racing consumer cancellation, then emit the
    /// one terminal chunk for this id.
    async fn drive_promise(self: Arc<Self>, id: u64, future: NodeFuture, path: Path) {
        let outcome = tokio::select! {
            () = self.cancel.cancelled() => {
                trace!(id, "promise leaf cancelled");
                return;
            }
            outcome = future => outcome,
        };
        let event = match outcome {
            Ok(node) => match self.dehydrate(node, &path) {
                Ok(dehydrated) => PromiseEvent::Fulfilled(dehydrated),
                Err(err) => {
                    self.observe(&err, &path);
                    PromiseEvent::Rejected(self.format(&err, &path))
                }
            },
            Err(err) => {
                self.observe(&err, &path);
                PromiseEvent::Rejected(self.format(&err, &path))
            }
        };
        self.emit(event.into_frame(id)).await;
    }

    /// Drive the user sequence to its terminal, racing consumer
    /// cancellation at every step.  Cancellation drops the sequence, which
    /// is its cleanup hook.
    async fn drive_stream(self: Arc<Self>, id: u64, mut stream: NodeStream, path: Path) {
        loop {
            let item = tokio::select! {
                () = self.cancel.cancelled() => {
                    trace!(id, "sequence leaf cancelled");
                    return;
                }
                item = stream.next() => item,
            };
            let event = match item {
                Some(Ok(node)) => match self.dehydrate(node, &path) {
                    Ok(dehydrated) => StreamEvent::Value(dehydrated),
                    Err(err) => {
                        self.observe(&err, &path);
                        StreamEvent::Error(self.format(&err, &path))
                    }
                },
                Some(Err(err)) => {
                    self.observe(&err, &path);
                    StreamEvent::Error(self.format(&err, &path))
                }
                None => StreamEvent::Done,
            };
            let terminal = !matches!(event, StreamEvent::Value(_));
            self.emit(event.into_frame(id)).await;
            if terminal {
                return;
            }
        }
    }

    async fn emit(&self, frame: Frame) {
        let id = frame.id;
        let status = frame.status;
        let mut value = frame.to_value();
        if let Some(hook) = &self.opts.serialize {
            value = hook(value);
        }
        trace!(id, status, "chunk emitted");
        if self.chunks.send(value).await.is_err() {
            trace!(id, "chunk receiver gone");
        }
    }

    fn observe(&self, err: &Error, path: &Path) {
        warn!(path = %path, error = %err, "deferred leaf failed");
        if let Some(hook) = &self.opts.on_error {
            hook(err, path);
        }
    }

    fn format(&self, err: &Error, path: &Path) -> Value {
        match &self.opts.format_error {
            Some(hook) => hook(err, path),
            None => serde_json::json!({ "message": err.to_string() }),
        }
    }

    fn depth_error(&self, path: &Path) -> Option<Error> {
        let limit = self.opts.max_depth?;
        (path.len() > limit).then(|| Error::MaxDepth { path: path.clone(), limit })
    }
}

/// Flatten a node below the inspected level to plain JSON.  Deferred leaves
/// down here have no addressable slot in the wire format and are refused.
fn flatten_plain(node: Node, path: &Path) -> Result<Value, Error> {
    match node {
        Node::Value(value) => Ok(value),
        Node::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                out.push(flatten_plain(item, &path.index(i))?);
            }
            Ok(Value::Array(out))
        }
        Node::Object(map) => {
            let mut out = Map::new();
            for (key, entry) in map {
                let entry_path = path.key(key.clone());
                out.insert(key, flatten_plain(entry, &entry_path)?);
            }
            Ok(Value::Object(out))
        }
        Node::Promise(_) | Node::Stream(_) => {
            Err(Error::DeferredTooDeep { path: path.clone() })
        }
    }
}
