//! Streaming JSON Lines codec for value trees with deferred leaves.
//!
//! A root mapping whose fields may be futures or lazy sequences is
//! dehydrated into one head line plus a multiplex of chunk lines keyed by
//! integer chunk-id, and rehydrated on the receiving side into a tree whose
//! deferred leaves resolve as bytes arrive.  Chunk-ids settle out of order;
//! per-id event order is preserved; a transport cut interrupts every
//! unresolved leaf.
//!
//! ```text
//! {"x":[[0],[null,0,0]]}      head: x is promise chunk-id 0
//! [0,0,[[7]]]                 chunk: id 0 fulfilled with 7
//! ```
//!
//! Producer side: [`produce`] turns a [`Node`] tree into a line stream.
//! Consumer side: [`consume`] (or [`consume_reader`]) drives the reverse
//! transformation and hands back the head via [`Consumer::head`].

pub mod consume;
pub mod controlled;
pub mod deferred;
pub mod error;
pub mod framing;
pub mod node;
pub mod path;
pub mod produce;

mod demux;

pub use consume::{ConsumeOptions, Consumer, Head, consume, consume_reader};
pub use controlled::{Controlled, Controller, controlled};
pub use deferred::{Deferred, Pending};
pub use error::{BoxError, Error};
pub use framing::LineFramer;
pub use node::{Node, NodeFuture, NodeStream};
pub use path::{Path, Segment};
pub use produce::{ProduceOptions, Produced, produce};
