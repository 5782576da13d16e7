use crate::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// The settle half of a single-shot rendezvous.
///
/// `resolve`/`reject` settle the paired [`Pending`] exactly once; later
/// calls are silently ignored.  Dropping an unsettled `Deferred` settles the
/// pending side with [`Error::Interrupted`].
///
/// Used wherever a value is claimed before it exists: the consumer's head,
/// and sub-stream controllers for chunk-ids observed before they are
/// referenced.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T, Error>>>>,
}

/// The await half; a future yielding the settled result.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Deferred<T> {
    pub fn new() -> (Deferred<T>, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        (Deferred { tx: Mutex::new(Some(tx)) }, Pending { rx })
    }

    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, err: Error) {
        self.settle(Err(err));
    }

    pub fn is_settled(&self) -> bool {
        self.tx.lock().expect("deferred mutex poisoned").is_none()
    }

    fn settle(&self, result: Result<T, Error>) {
        if let Some(tx) = self.tx.lock().expect("deferred mutex poisoned").take() {
            // An error here means the pending side was dropped; nothing to do.
            let _ = tx.send(result);
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without settling.
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Interrupted)),
            Poll::Pending => Poll::Pending,
        }
    }
}
