use crate::controlled::{Controlled, Controller, controlled};
use crate::deferred::{Deferred, Pending};
use crate::error::Error;
use crate::node::Node;
use dl_wire::Frame;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// The rehydrated head: one entry per top-level key of the root mapping.
pub type Head = BTreeMap<String, Node>;

/// Routes incoming chunk frames to per-chunk-id sub-streams.
///
/// A sub-stream controller is installed when rehydration first *references*
/// an id.  A chunk *observed* before that parks the caller on a buffered
/// registration — the await happens inside the routing path, so the line
/// driver stays serialized until the consumer catches up.  That await is the
/// codec's flow-control point: unrouted chunks are never buffered, the
/// writer is simply held back.
pub(crate) struct Demux {
    state: Mutex<State>,
}

struct State {
    controllers: HashMap<u64, Controller<Frame>>,
    pending: HashMap<u64, Deferred<Controller<Frame>>>,
    head: Option<Deferred<Head>>,
    interrupted: bool,
}

enum Target {
    Ready(Controller<Frame>),
    Parked(Pending<Controller<Frame>>),
    Discard,
}

impl Demux {
    pub fn new(head: Deferred<Head>) -> Self {
        Demux {
            state: Mutex::new(State {
                controllers: HashMap::new(),
                pending: HashMap::new(),
                head: Some(head),
                interrupted: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("demux mutex poisoned")
    }

    /// Install the sub-stream for a freshly referenced id, waking any chunk
    /// parked on it.  After interruption the sub-stream carries only the
    /// interruption error.
    pub fn register(&self, id: u64) -> Controlled<Frame> {
        let (controller, sub) = controlled();
        let mut st = self.lock();
        if st.interrupted {
            drop(st);
            trace!(id, "reference after interruption");
            controller.fail(Error::Interrupted);
            return sub;
        }
        if let Some(parked) = st.pending.remove(&id) {
            trace!(id, "resolving buffered registration");
            parked.resolve(controller.clone());
        }
        st.controllers.insert(id, controller);
        sub
    }

    /// Drop the controller for an id whose terminal event was observed.
    pub fn release(&self, id: u64) {
        self.lock().controllers.remove(&id);
        trace!(id, "sub-stream released");
    }

    /// Deliver one frame.  Suspends while the frame's id is unreferenced;
    /// the caller must be the single line driver (at most one parked chunk
    /// per id at a time).
    pub async fn route(&self, frame: Frame) {
        let id = frame.id;
        let target = {
            let mut st = self.lock();
            if st.interrupted {
                Target::Discard
            } else if let Some(controller) = st.controllers.get(&id) {
                Target::Ready(controller.clone())
            } else {
                let (deferred, pending) = Deferred::new();
                st.pending.insert(id, deferred);
                Target::Parked(pending)
            }
        };
        match target {
            Target::Ready(controller) => {
                if !controller.enqueue(frame) {
                    // The wrapper was dropped without draining; forget it.
                    debug!(id, "wrapper gone; discarding sub-stream");
                    self.release(id);
                }
            }
            Target::Parked(pending) => {
                debug!(id, "chunk observed before reference; holding the writer");
                match pending.await {
                    Ok(controller) => {
                        let _ = controller.enqueue(frame);
                    }
                    Err(_) => trace!(id, "interrupted while parked; chunk dropped"),
                }
            }
            Target::Discard => {}
        }
    }

    /// Deliver the rehydrated head.  No-op once settled or interrupted.
    pub fn resolve_head(&self, head: Head) {
        if let Some(deferred) = self.lock().head.take() {
            deferred.resolve(head);
        }
    }

    /// Tear everything down: reject parked registrations, fail every live
    /// sub-stream, reject an undelivered head.  Idempotent.
    pub fn interrupt(&self) {
        let mut st = self.lock();
        if st.interrupted {
            return;
        }
        st.interrupted = true;
        let outstanding = st.controllers.len() + st.pending.len();
        for (_, parked) in st.pending.drain() {
            parked.reject(Error::Interrupted);
        }
        for (_, controller) in st.controllers.drain() {
            controller.fail(Error::Interrupted);
        }
        let head = st.head.take();
        drop(st);
        if let Some(deferred) = head {
            deferred.reject(Error::Interrupted);
        }
        debug!(outstanding, "stream interrupted");
    }
}
