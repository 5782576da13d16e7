use crate::controlled::Controlled;
use crate::deferred::{Deferred, Pending};
use crate::demux::Demux;
pub use crate::demux::Head;
use crate::error::Error;
use crate::framing::LineFramer;
use crate::node::Node;
use bytes::Bytes;
use dl_wire::{Dehydrated, Frame, LeafKind, PromiseEvent, SlotKey, StreamEvent};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Applied to every line's JSON value before interpretation.
pub type DeserializeHook = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Observes consumer-side failures: transport errors, malformed lines.
pub type ErrorObserver = Arc<dyn Fn(&Error) + Send + Sync>;

/// Maps a wire error payload back to an [`Error`].  Returning `None` falls
/// back to [`Error::Remote`] carrying the raw payload.
pub type WireErrorMapper = Arc<dyn Fn(&Value) -> Option<Error> + Send + Sync>;

/// Consumer-side options.
#[derive(Clone, Default)]
pub struct ConsumeOptions {
    pub deserialize: Option<DeserializeHook>,
    pub on_error: Option<ErrorObserver>,
    pub format_error: Option<WireErrorMapper>,
}

/// Rehydrate a produced byte stream.
///
/// Spawns a driver task that frames lines, delivers the head, and routes
/// every chunk to its sub-stream — call inside a Tokio runtime.  The driver
/// runs until the source ends, errors, or [`Consumer::abort`] is called;
/// all three tear down outstanding wrappers with [`Error::Interrupted`].
pub fn consume<S>(source: S, opts: ConsumeOptions) -> Consumer
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    let (head_deferred, head_pending) = Deferred::new();
    let demux = Arc::new(Demux::new(head_deferred));
    let hydrator = Hydrator {
        demux: Arc::clone(&demux),
        format_error: opts.format_error.clone(),
    };
    let abort = CancellationToken::new();
    tokio::spawn(drive(Box::pin(source), demux, hydrator, opts, abort.clone()));
    Consumer { head: Some(head_pending), abort }
}

/// [`consume`] for reader-style sources.
pub fn consume_reader<R>(reader: R, opts: ConsumeOptions) -> Consumer
where
    R: tokio::io::AsyncRead + Send + 'static,
{
    consume(ReaderStream::new(reader), opts)
}

/// Handle on an incoming stream: the head future plus local teardown.
///
/// Deferred leaves inside the head keep resolving after the `Consumer` is
/// dropped; only [`Consumer::abort`] (or the source ending) stops the
/// driver.
pub struct Consumer {
    head: Option<Pending<Head>>,
    abort: CancellationToken,
}

impl Consumer {
    /// Await the head mapping.  Single-shot: the head moves out to the
    /// caller.
    pub async fn head(&mut self) -> Result<Head, Error> {
        match self.head.take() {
            Some(pending) => pending.await,
            None => Err(Error::protocol("head already consumed")),
        }
    }

    /// Tear down locally: every unresolved wrapper receives
    /// [`Error::Interrupted`].
    pub fn abort(&self) {
        self.abort.cancel();
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type ByteSource = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

enum Parsed {
    Head(Head),
    Chunk(Frame),
}

async fn drive(
    mut source: ByteSource,
    demux: Arc<Demux>,
    hydrator: Hydrator,
    opts: ConsumeOptions,
    abort: CancellationToken,
) {
    let mut framer = LineFramer::new();
    let mut head_seen = false;
    'read: loop {
        let chunk = tokio::select! {
            biased;
            () = abort.cancelled() => {
                debug!("consumer aborted");
                break 'read;
            }
            chunk = source.next() => chunk,
        };
        let bytes = match chunk {
            None => {
                debug!("byte stream ended");
                break 'read;
            }
            Some(Err(err)) => {
                report(&opts, &Error::from(err));
                break 'read;
            }
            Some(Ok(bytes)) => bytes,
        };
        let lines = match framer.push(&bytes) {
            Ok(lines) => lines,
            Err(err) => {
                report(&opts, &err);
                break 'read;
            }
        };
        for line in lines {
            let parsed = match parse_line(&line, head_seen, &hydrator, &opts) {
                Ok(parsed) => parsed,
                // Framing integrity is gone; poison the whole stream.
                Err(err) => {
                    report(&opts, &err);
                    break 'read;
                }
            };
            match parsed {
                Parsed::Head(head) => {
                    head_seen = true;
                    demux.resolve_head(head);
                    debug!("head delivered");
                }
                Parsed::Chunk(frame) => {
                    trace!(id = frame.id, status = frame.status, "routing chunk");
                    let routed = tokio::select! {
                        biased;
                        () = abort.cancelled() => false,
                        () = demux.route(frame) => true,
                    };
                    if !routed {
                        debug!("consumer aborted while routing");
                        break 'read;
                    }
                }
            }
        }
    }
    if let Some(residual) = framer.finish() {
        warn!(len = residual.len(), "discarding partial trailing line");
    }
    demux.interrupt();
}

fn parse_line(
    line: &str,
    head_seen: bool,
    hydrator: &Hydrator,
    opts: &ConsumeOptions,
) -> Result<Parsed, Error> {
    let mut value: Value = serde_json::from_str(line)?;
    if let Some(hook) = &opts.deserialize {
        value = hook(value);
    }
    if head_seen {
        return Ok(Parsed::Chunk(Frame::from_value(value)?));
    }
    let wire_head = dl_wire::decode_head(value)?;
    let mut head = Head::new();
    for (key, dehydrated) in wire_head {
        head.insert(key, hydrator.hydrate(dehydrated)?);
    }
    Ok(Parsed::Head(head))
}

fn report(opts: &ConsumeOptions, err: &Error) {
    warn!(error = %err, "incoming stream failed");
    if let Some(hook) = &opts.on_error {
        hook(err);
    }
}

// ---------------------------------------------------------------------------
// Hydrator
// ---------------------------------------------------------------------------

/// Rebuilds nodes from dehydrated values, binding each descriptor to a
/// per-id sub-stream from the demuxer.
#[derive(Clone)]
pub(crate) struct Hydrator {
    demux: Arc<Demux>,
    format_error: Option<WireErrorMapper>,
}

impl Hydrator {
    /// Reverse one dehydration step.  Descriptor interpretation is driven
    /// entirely by the recorded kind tag.
    pub(crate) fn hydrate(&self, dehydrated: Dehydrated) -> Result<Node, Error> {
        let Dehydrated { payload, descriptors } = dehydrated;
        if descriptors.is_empty() {
            return Ok(Node::Value(payload));
        }
        if let [desc] = descriptors.as_slice() {
            if desc.key == SlotKey::Whole {
                return Ok(self.wrap(desc.kind, desc.id));
            }
        }
        match payload {
            Value::Array(items) => {
                let mut nodes: Vec<Node> = items.into_iter().map(Node::Value).collect();
                for desc in descriptors {
                    let SlotKey::Index(i) = desc.key else {
                        return Err(Error::protocol("descriptor key does not address an array slot"));
                    };
                    let slot = nodes.get_mut(i).ok_or_else(|| {
                        Error::protocol(format!("descriptor addresses missing index {i}"))
                    })?;
                    *slot = self.wrap(desc.kind, desc.id);
                }
                Ok(Node::Array(nodes))
            }
            Value::Object(map) => {
                let mut nodes: BTreeMap<String, Node> =
                    map.into_iter().map(|(k, v)| (k, Node::Value(v))).collect();
                for desc in descriptors {
                    let SlotKey::Field(key) = desc.key else {
                        return Err(Error::protocol("descriptor key does not address a mapping slot"));
                    };
                    match nodes.get_mut(&key) {
                        Some(slot) => *slot = self.wrap(desc.kind, desc.id),
                        None => {
                            return Err(Error::protocol(format!(
                                "descriptor addresses missing field `{key}`"
                            )));
                        }
                    }
                }
                Ok(Node::Object(nodes))
            }
            _ => Err(Error::protocol("descriptors attached to a non-container payload")),
        }
    }

    fn wrap(&self, kind: LeafKind, id: u64) -> Node {
        let sub = self.demux.register(id);
        match kind {
            LeafKind::Promise => self.wrap_promise(id, sub),
            LeafKind::Stream => self.wrap_stream(id, sub),
        }
    }

    /// A future backed by the single read of its sub-stream.
    fn wrap_promise(&self, id: u64, mut sub: Controlled<Frame>) -> Node {
        let hydrator = self.clone();
        Node::promise(async move {
            let settled = match sub.next().await {
                Some(Ok(frame)) => match PromiseEvent::from_frame(frame) {
                    Ok(PromiseEvent::Fulfilled(dehydrated)) => hydrator.hydrate(dehydrated),
                    Ok(PromiseEvent::Rejected(payload)) => Err(hydrator.remote_error(payload)),
                    Err(err) => Err(Error::from(err)),
                },
                Some(Err(err)) => Err(err),
                None => Err(Error::protocol("promise sub-stream closed without a chunk")),
            };
            hydrator.demux.release(id);
            settled
        })
    }

    /// A lazy sequence reading its sub-stream until a terminal event.
    fn wrap_stream(&self, id: u64, mut sub: Controlled<Frame>) -> Node {
        let hydrator = self.clone();
        Node::stream(async_stream::stream! {
            loop {
                match sub.next().await {
                    Some(Ok(frame)) => match StreamEvent::from_frame(frame) {
                        Ok(StreamEvent::Value(dehydrated)) => yield hydrator.hydrate(dehydrated),
                        Ok(StreamEvent::Done) => break,
                        Ok(StreamEvent::Error(payload)) => {
                            yield Err(hydrator.remote_error(payload));
                            break;
                        }
                        Err(err) => {
                            yield Err(Error::from(err));
                            break;
                        }
                    },
                    Some(Err(err)) => {
                        yield Err(err);
                        break;
                    }
                    None => break,
                }
            }
            hydrator.demux.release(id);
        })
    }

    fn remote_error(&self, payload: Value) -> Error {
        if let Some(hook) = &self.format_error {
            if let Some(err) = hook(&payload) {
                return err;
            }
        }
        Error::Remote(payload)
    }
}
