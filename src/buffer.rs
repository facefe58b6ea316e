//! Append-only byte buffer with line and delimiter consumption primitives
//!
//! Every transfer owns one [`StreamBuf`]; all response bytes are appended to
//! it before any observer hook runs. Streaming consumers (the SSE parser, the
//! MCP framing layer, user stream hooks) drain it incrementally; buffered
//! consumers read the whole body at completion.

use bytes::{Bytes, BytesMut};

/// Mutable byte accumulator owned by a single transfer
///
/// All `consume_*` operations are destructive; [`StreamBuf::peek`] is not.
#[derive(Debug, Default)]
pub struct StreamBuf {
    data: BytesMut,
}

impl StreamBuf {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the end of the buffer
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Borrow the buffered bytes without consuming them
    pub fn peek(&self) -> &[u8] {
        &self.data
    }

    /// Drain the buffer, returning everything it held
    pub fn consume_all(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    /// Consume one line, if a complete one is buffered
    ///
    /// Returns the bytes preceding the first `\n`, with an immediately
    /// preceding `\r` stripped; the `\n` itself is consumed. Returns `None`
    /// and leaves the buffer untouched when no newline is present.
    pub fn consume_line(&mut self) -> Option<Bytes> {
        let pos = self.data.iter().position(|&b| b == b'\n')?;
        let mut line = self.data.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }

    /// Consume up to (and past) the first occurrence of `delim`
    ///
    /// The returned bytes stop before the delimiter unless `include_delim` is
    /// set; the buffer always advances past it. Returns `None` and leaves the
    /// buffer untouched when the delimiter is absent.
    pub fn consume_until(&mut self, delim: &[u8], include_delim: bool) -> Option<Bytes> {
        if delim.is_empty() {
            return None;
        }
        let pos = self
            .data
            .windows(delim.len())
            .position(|window| window == delim)?;
        let mut chunk = self.data.split_to(pos + delim.len());
        if !include_delim {
            chunk.truncate(pos);
        }
        Some(chunk.freeze())
    }

    /// Consume up to `n` bytes from the front of the buffer
    pub fn consume_bytes(&mut self, n: usize) -> Bytes {
        let n = n.min(self.data.len());
        self.data.split_to(n).freeze()
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop all buffered bytes
    pub fn clear(&mut self) {
        self.data.clear();
    }
}
