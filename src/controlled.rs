use crate::error::Error;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Create an in-memory lazy sequence driven from the outside.
///
/// The [`Controller`] enqueues items, then closes or fails the stream; the
/// [`Controlled`] half implements `Stream`.  Enqueueing is synchronous and
/// unbounded — when a bounded buffer matters, the caller must gate *before*
/// enqueueing (the demuxer does exactly that at its registration await).
pub fn controlled<T>() -> (Controller<T>, Controlled<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Controller { tx }, Controlled { rx, terminated: false })
}

enum Signal<T> {
    Item(T),
    End,
    Fault(Error),
}

/// External handle feeding a [`Controlled`] stream.
pub struct Controller<T> {
    tx: mpsc::UnboundedSender<Signal<T>>,
}

// Manual impl: `T` itself need not be `Clone`.
impl<T> Clone for Controller<T> {
    fn clone(&self) -> Self {
        Controller { tx: self.tx.clone() }
    }
}

impl<T> Controller<T> {
    /// Queue an item.  Returns false when the consuming side is gone.
    pub fn enqueue(&self, item: T) -> bool {
        self.tx.send(Signal::Item(item)).is_ok()
    }

    /// Terminate the stream cleanly after the queued items drain.
    pub fn close(&self) {
        let _ = self.tx.send(Signal::End);
    }

    /// Terminate the stream with one final error after the queued items
    /// drain.
    pub fn fail(&self, err: Error) {
        let _ = self.tx.send(Signal::Fault(err));
    }

    /// Resolves when the consuming side dropped the stream.  This is the
    /// rendezvous a producer races against while generating items, so that
    /// an abandoned consumer does not leak work.
    pub async fn cancelled(&self) {
        self.tx.closed().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The consuming half; yields every enqueued item, then `None` after
/// `close` or one `Err` after `fail`.
pub struct Controlled<T> {
    rx: mpsc::UnboundedReceiver<Signal<T>>,
    terminated: bool,
}

impl<T> Stream for Controlled<T> {
    type Item = Result<T, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Signal::Item(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Signal::End)) | Poll::Ready(None) => {
                this.terminated = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Signal::Fault(err))) => {
                this.terminated = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
