use crate::error::Error;
use bytes::BytesMut;

/// Stateful splitter from byte chunks to complete UTF-8 text lines.
///
/// Buffers at the byte level and cuts only at `\n`, so a multi-byte
/// codepoint split across input chunks reassembles before validation.
/// Content is not interpreted.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer::default()
    }

    /// Append a chunk and return every line completed by it, in order.
    /// A line that is not valid UTF-8 is a protocol error.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, Error> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            let text = std::str::from_utf8(&line)
                .map_err(|_| Error::protocol("line is not valid UTF-8"))?;
            lines.push(text.to_owned());
        }
        Ok(lines)
    }

    /// End of input: surrender any residual partial line.  A well-formed
    /// stream terminates its last line with `\n`, so the caller logs and
    /// discards whatever comes back.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let residual = self.buf.split_off(0);
        Some(String::from_utf8_lossy(&residual).into_owned())
    }
}
