use bytes::Bytes;
use futures::Stream;
use std::io;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// An in-memory byte transport with an explicit write handle.
///
/// Dropping the [`PipeTx`] ends the stream cleanly (the "transport closed"
/// case); [`PipeTx::fail`] injects a transport error.  Either way the
/// consumer side observes exactly what a real socket would deliver.
pub fn byte_pipe() -> (PipeTx, impl Stream<Item = Result<Bytes, io::Error>> + Send) {
    let (tx, rx) = mpsc::channel(64);
    (PipeTx { tx }, ReceiverStream::new(rx))
}

pub struct PipeTx {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl PipeTx {
    pub async fn send(&self, bytes: impl Into<Bytes>) {
        self.tx
            .send(Ok(bytes.into()))
            .await
            .expect("pipe consumer dropped");
    }

    /// Send one newline-terminated line.
    pub async fn send_line(&self, line: &str) {
        self.send(format!("{line}\n")).await;
    }

    /// Inject a transport error, then close.
    pub async fn fail(self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Close the transport cleanly (equivalent to dropping the handle).
    pub fn cut(self) {}
}

/// Re-chunk a byte blob into `size`-byte pieces, exercising line reassembly
/// across arbitrary chunk boundaries.
pub fn chunked(
    data: impl Into<Bytes>,
    size: usize,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    let data = data.into();
    assert!(size > 0, "chunk size must be positive");
    let pieces: Vec<Result<Bytes, io::Error>> = (0..data.len())
        .step_by(size)
        .map(|start| Ok(data.slice(start..data.len().min(start + size))))
        .collect();
    futures::stream::iter(pieces)
}

/// Drain a line stream, asserting newline termination and returning the
/// lines with their terminators stripped.
pub async fn collect_lines<S, E>(stream: S) -> Vec<String>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Debug,
{
    use futures::StreamExt;
    let mut lines = Vec::new();
    let mut stream = stream;
    while let Some(item) = stream.next().await {
        let bytes = item.expect("line stream item");
        let text = std::str::from_utf8(&bytes).expect("utf8 line");
        assert!(text.ends_with('\n'), "line must be newline-terminated: {text:?}");
        lines.push(text.trim_end_matches('\n').to_owned());
    }
    lines
}

/// Forward up to `n` items from a line stream into a pipe.  Returns how many
/// were forwarded (fewer when the stream ends first).
pub async fn pump_lines<S, E>(stream: &mut S, pipe: &PipeTx, n: usize) -> usize
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Debug,
{
    use futures::StreamExt;
    let mut forwarded = 0;
    while forwarded < n {
        match stream.next().await {
            Some(item) => {
                pipe.send(item.expect("line stream item")).await;
                forwarded += 1;
            }
            None => break,
        }
    }
    forwarded
}
