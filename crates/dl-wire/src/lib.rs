// dl-wire: Wire-format types for the deferred-value JSON Lines codec.
//
// A stream is one head line followed by zero or more chunk lines, each a
// complete JSON value terminated by `\n`:
//
// ```json
// { "<key>": [[<payload>], [<key>, <kind>, <id>]*], ... }
// [<chunk-id>, <status>, <payload>?]
// ```
//
// The shapes are positional arrays, so encoding builds `serde_json::Value`
// directly instead of deriving serde impls.  Decoding is strict: bad tags,
// missing cells, and malformed triples are errors, never best-effort.

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Frozen wire constants
// ---------------------------------------------------------------------------

/// Frozen status codes, per leaf kind.
///
/// Promise and sequence chunks share a status *position* but not a status
/// *register*: `[id, 0, v]` fulfils a promise, while a bare `[id, 0]` ends a
/// sequence.  Interpretation is always driven by the descriptor's kind.
pub mod status {
    pub const PROMISE_FULFILLED: u64 = 0;
    pub const PROMISE_REJECTED: u64 = 1;

    pub const STREAM_DONE: u64 = 0;
    pub const STREAM_VALUE: u64 = 1;
    pub const STREAM_ERROR: u64 = 2;
}

/// The literal standing in for a deferred leaf inside a dehydrated payload.
///
/// Only meaningful in a slot addressed by a descriptor; payload integers
/// anywhere else are ordinary data.
pub const PLACEHOLDER: u64 = 0;

/// Returns the placeholder as a payload value.
pub fn placeholder() -> Value {
    Value::from(PLACEHOLDER)
}

// ---------------------------------------------------------------------------
// Decode errors
// ---------------------------------------------------------------------------

/// Every way a line can fail strict decoding.
#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("line is not a JSON array")]
    NotAnArray,
    #[error("frame has {0} elements, expected 2 or 3")]
    BadFrameLen(usize),
    #[error("frame id is not a non-negative integer")]
    BadId,
    #[error("frame status is not a non-negative integer")]
    BadStatus,
    #[error("dehydrated value is missing its payload cell")]
    MissingPayload,
    #[error("descriptor is not a [key, kind, id] triple")]
    BadDescriptor,
    #[error("descriptor key must be null, an index, or a string")]
    BadSlotKey,
    #[error("unknown leaf kind tag {0}")]
    BadLeafKind(Value),
    #[error("chunk {id} carries unexpected status {status}")]
    UnexpectedStatus { id: u64, status: u64 },
    #[error("chunk {id} status {status} requires a payload")]
    MissingBody { id: u64, status: u64 },
    #[error("head line is not a JSON object")]
    BadHead,
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// What a chunk-id will eventually deliver.  Wire tag: `0` promise,
/// `1` sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Promise,
    Stream,
}

impl LeafKind {
    pub fn code(self) -> u64 {
        match self {
            LeafKind::Promise => 0,
            LeafKind::Stream => 1,
        }
    }

    pub fn from_code(v: &Value) -> Result<Self, WireError> {
        match v.as_u64() {
            Some(0) => Ok(LeafKind::Promise),
            Some(1) => Ok(LeafKind::Stream),
            _ => Err(WireError::BadLeafKind(v.clone())),
        }
    }
}

/// Where a wrapper is grafted back into the payload.  Wire shape:
/// `null` (replace the payload itself), a number (array index), or a string
/// (mapping key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKey {
    Whole,
    Index(usize),
    Field(String),
}

impl SlotKey {
    fn to_value(&self) -> Value {
        match self {
            SlotKey::Whole => Value::Null,
            SlotKey::Index(i) => Value::from(*i),
            SlotKey::Field(k) => Value::from(k.clone()),
        }
    }

    fn from_value(v: &Value) -> Result<Self, WireError> {
        match v {
            Value::Null => Ok(SlotKey::Whole),
            Value::Number(n) => match n.as_u64() {
                Some(i) => Ok(SlotKey::Index(usize::try_from(i).map_err(|_| WireError::BadSlotKey)?)),
                None => Err(WireError::BadSlotKey),
            },
            Value::String(s) => Ok(SlotKey::Field(s.clone())),
            _ => Err(WireError::BadSlotKey),
        }
    }
}

/// One deferred leaf inside a dehydrated value: the slot it occupies, the
/// kind of sub-stream it binds to, and the chunk-id naming that sub-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub key: SlotKey,
    pub kind: LeafKind,
    pub id: u64,
}

// ---------------------------------------------------------------------------
// Dehydrated values
// ---------------------------------------------------------------------------

/// A payload with its deferred slots described.  Wire shape:
/// `[[<payload>], [<key>, <kind>, <id>]*]`.
///
/// The payload rides in its own single-element array so that a literal `0`
/// payload is never confused with the placeholder — the enclosing cell, not
/// the integer, carries the meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct Dehydrated {
    pub payload: Value,
    pub descriptors: Vec<Descriptor>,
}

impl Dehydrated {
    /// A plain value with no deferred slots.
    pub fn leaf(payload: Value) -> Self {
        Dehydrated { payload, descriptors: Vec::new() }
    }

    /// A value that *is* a single deferred leaf: placeholder payload plus a
    /// whole-value descriptor.
    pub fn whole(kind: LeafKind, id: u64) -> Self {
        Dehydrated {
            payload: placeholder(),
            descriptors: vec![Descriptor { key: SlotKey::Whole, kind, id }],
        }
    }

    pub fn to_value(&self) -> Value {
        let mut parts = Vec::with_capacity(1 + self.descriptors.len());
        parts.push(Value::Array(vec![self.payload.clone()]));
        for d in &self.descriptors {
            parts.push(Value::Array(vec![
                d.key.to_value(),
                Value::from(d.kind.code()),
                Value::from(d.id),
            ]));
        }
        Value::Array(parts)
    }

    pub fn from_value(v: Value) -> Result<Self, WireError> {
        let Value::Array(parts) = v else {
            return Err(WireError::NotAnArray);
        };
        let mut parts = parts.into_iter();
        let payload = match parts.next() {
            Some(Value::Array(cell)) if cell.len() == 1 => {
                cell.into_iter().next().unwrap_or(Value::Null)
            }
            _ => return Err(WireError::MissingPayload),
        };
        let mut descriptors = Vec::new();
        for part in parts {
            let Value::Array(triple) = part else {
                return Err(WireError::BadDescriptor);
            };
            let [key, kind, id] = <[Value; 3]>::try_from(triple)
                .map_err(|_| WireError::BadDescriptor)?;
            descriptors.push(Descriptor {
                key: SlotKey::from_value(&key)?,
                kind: LeafKind::from_code(&kind)?,
                id: id.as_u64().ok_or(WireError::BadId)?,
            });
        }
        Ok(Dehydrated { payload, descriptors })
    }
}

// ---------------------------------------------------------------------------
// Head
// ---------------------------------------------------------------------------

/// Encode the once-per-stream head mapping.
pub fn encode_head(head: &BTreeMap<String, Dehydrated>) -> Value {
    let mut map = Map::new();
    for (key, dehydrated) in head {
        map.insert(key.clone(), dehydrated.to_value());
    }
    Value::Object(map)
}

/// Decode the head line.  Rejects anything but a JSON object of dehydrated
/// values.
pub fn decode_head(v: Value) -> Result<BTreeMap<String, Dehydrated>, WireError> {
    let Value::Object(map) = v else {
        return Err(WireError::BadHead);
    };
    let mut head = BTreeMap::new();
    for (key, value) in map {
        head.insert(key, Dehydrated::from_value(value)?);
    }
    Ok(head)
}

// ---------------------------------------------------------------------------
// Chunk frames
// ---------------------------------------------------------------------------

/// A chunk line before kind-specific interpretation:
/// `[<id>, <status>, <payload>?]`.
///
/// `[id, 1, x]` is a promise rejection or a sequence value depending on the
/// descriptor that introduced `id`; decoding stays kind-agnostic and the
/// per-kind events below finish the job.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: u64,
    pub status: u64,
    pub body: Option<Value>,
}

impl Frame {
    pub fn to_value(&self) -> Value {
        match &self.body {
            Some(body) => json!([self.id, self.status, body]),
            None => json!([self.id, self.status]),
        }
    }

    pub fn from_value(v: Value) -> Result<Self, WireError> {
        let Value::Array(parts) = v else {
            return Err(WireError::NotAnArray);
        };
        if parts.len() < 2 || parts.len() > 3 {
            return Err(WireError::BadFrameLen(parts.len()));
        }
        let mut parts = parts.into_iter();
        let id = parts.next().and_then(|v| v.as_u64()).ok_or(WireError::BadId)?;
        let status = parts
            .next()
            .and_then(|v| v.as_u64())
            .ok_or(WireError::BadStatus)?;
        Ok(Frame { id, status, body: parts.next() })
    }
}

/// The two events a promise sub-stream can carry.  Exactly one per id.
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseEvent {
    Fulfilled(Dehydrated),
    Rejected(Value),
}

impl PromiseEvent {
    pub fn into_frame(self, id: u64) -> Frame {
        match self {
            PromiseEvent::Fulfilled(d) => Frame {
                id,
                status: status::PROMISE_FULFILLED,
                body: Some(d.to_value()),
            },
            PromiseEvent::Rejected(e) => Frame {
                id,
                status: status::PROMISE_REJECTED,
                body: Some(e),
            },
        }
    }

    pub fn from_frame(frame: Frame) -> Result<Self, WireError> {
        let Frame { id, status, body } = frame;
        let body = body.ok_or(WireError::MissingBody { id, status })?;
        match status {
            status::PROMISE_FULFILLED => Ok(PromiseEvent::Fulfilled(Dehydrated::from_value(body)?)),
            status::PROMISE_REJECTED => Ok(PromiseEvent::Rejected(body)),
            _ => Err(WireError::UnexpectedStatus { id, status }),
        }
    }
}

/// The events a sequence sub-stream can carry: any number of values, then
/// one terminal (`Done` or `Error`).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Value(Dehydrated),
    Done,
    Error(Value),
}

impl StreamEvent {
    pub fn into_frame(self, id: u64) -> Frame {
        match self {
            StreamEvent::Value(d) => Frame {
                id,
                status: status::STREAM_VALUE,
                body: Some(d.to_value()),
            },
            StreamEvent::Done => Frame { id, status: status::STREAM_DONE, body: None },
            StreamEvent::Error(e) => Frame {
                id,
                status: status::STREAM_ERROR,
                body: Some(e),
            },
        }
    }

    pub fn from_frame(frame: Frame) -> Result<Self, WireError> {
        let Frame { id, status, body } = frame;
        match status {
            status::STREAM_DONE => Ok(StreamEvent::Done),
            status::STREAM_VALUE => {
                let body = body.ok_or(WireError::MissingBody { id, status })?;
                Ok(StreamEvent::Value(Dehydrated::from_value(body)?))
            }
            status::STREAM_ERROR => {
                Ok(StreamEvent::Error(body.ok_or(WireError::MissingBody { id, status })?))
            }
            _ => Err(WireError::UnexpectedStatus { id, status }),
        }
    }
}
