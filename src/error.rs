use crate::path::Path;
use serde_json::Value;

/// User-supplied failure carried through a deferred leaf.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// All codec failure modes, producer and consumer side.
///
/// Deferred-leaf errors never terminate the whole stream — they settle only
/// the leaf that raised them.  Global termination comes from transport
/// failure or an explicit abort, surfaced as [`Error::Interrupted`] on every
/// wrapper still outstanding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A deferred leaf sits deeper than the configured `max_depth`.
    #[error("deferred value at {path} exceeds max depth {limit}")]
    MaxDepth { path: Path, limit: usize },
    /// A deferred leaf is nested below a plain container, where the wire
    /// format has no slot to address it.
    #[error("deferred value at {path} is not directly addressable; move it to a container's top level")]
    DeferredTooDeep { path: Path },
    /// `produce` input was not a mapping or an array.
    #[error("root value must be a mapping or an array")]
    InvalidRoot,
    /// A failure raised by user code inside a future or sequence.
    #[error("user: {0}")]
    User(BoxError),
    /// The peer violated the wire discipline.
    #[error("protocol: {0}")]
    Protocol(String),
    /// An error payload received over the wire that no `format_error` hook
    /// claimed; the raw payload is preserved.
    #[error("remote: {0}")]
    Remote(Value),
    /// The byte stream ended or was torn down before this leaf settled.
    #[error("stream interrupted before completion")]
    Interrupted,
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("wire: {0}")]
    Wire(#[from] dl_wire::WireError),
}

impl Error {
    pub fn user(err: impl Into<BoxError>) -> Self {
        Error::User(err.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}
