//! Buffered framed I/O shared by the client session and backend connections.
//!
//! A `RecvBuffer` accumulates raw socket bytes; codecs scan it for one
//! complete frame, then carve the frame off as a cheap refcounted `Bytes`
//! slice. Carved slices stay valid after the buffer is refilled or reset, so
//! decoded replies may outlive the single decoder call that produced them.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// Hard cap on a single protocol line. Lines are short command headers in
/// every supported protocol; anything longer is a malformed stream.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const INITIAL_BUFFER_BYTES: usize = 4 * 1024;

/// Growable read buffer with cursor semantics.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: BytesMut,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_BYTES),
        }
    }

    /// Read more bytes from the socket into the buffer, growing as needed.
    ///
    /// Returns the number of bytes read; `0` means the peer closed the
    /// connection.
    pub async fn fill<S>(&mut self, io: &mut S) -> Result<usize, ProxyError>
    where
        S: AsyncRead + Unpin,
    {
        let n = io.read_buf(&mut self.buf).await?;
        Ok(n)
    }

    /// Unconsumed bytes currently buffered.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Find the end of the CRLF-terminated line starting at `from`.
    ///
    /// Returns the index one past the terminating `\n`, or `None` when the
    /// line is still incomplete. Fails when the line exceeds
    /// [`MAX_LINE_BYTES`].
    pub fn find_line(&self, from: usize) -> Result<Option<usize>, ProxyError> {
        find_crlf(&self.buf, from)
    }

    /// Carve the first `n` buffered bytes off as an owned slice.
    ///
    /// Panics in debug builds if fewer than `n` bytes are buffered; callers
    /// must have located a complete frame first.
    pub fn take(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Drop all buffered bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append bytes directly, bypassing the socket. Test seam.
    #[cfg(test)]
    pub fn push(&mut self, bytes: &[u8]) {
        use bytes::BufMut;
        self.buf.put_slice(bytes);
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Scan `buf[from..]` for CRLF, returning the index one past it.
pub fn find_crlf(buf: &[u8], from: usize) -> Result<Option<usize>, ProxyError> {
    let window = &buf[from.min(buf.len())..];
    match window.windows(2).position(|w| w == b"\r\n") {
        Some(i) => Ok(Some(from + i + 2)),
        None => {
            if window.len() > MAX_LINE_BYTES {
                return Err(ProxyError::Protocol(format!(
                    "line exceeds {MAX_LINE_BYTES} bytes"
                )));
            }
            Ok(None)
        }
    }
}

/// Outbound buffer; bytes accumulate across a whole batch and hit the socket
/// in one write.
#[derive(Debug, Default)]
pub struct SendBuffer {
    buf: BytesMut,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_BYTES),
        }
    }

    pub fn put(&mut self, bytes: &[u8]) {
        use bytes::BufMut;
        self.buf.put_slice(bytes);
    }

    /// Append the decimal form of an integer.
    pub fn put_int(&mut self, v: i64) {
        let mut tmp = [0u8; 24];
        self.put(write_decimal(&mut tmp, v));
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Write everything buffered in one socket write, then clear.
    pub async fn flush<S>(&mut self, io: &mut S) -> Result<(), ProxyError>
    where
        S: AsyncWrite + Unpin,
    {
        if self.buf.is_empty() {
            return Ok(());
        }
        io.write_all(&self.buf).await?;
        io.flush().await?;
        self.buf.clear();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Format `v` into `buf`, returning the written prefix.
fn write_decimal(buf: &mut [u8; 24], v: i64) -> &[u8] {
    use std::io::Write;
    let mut cur = std::io::Cursor::new(&mut buf[..]);
    // 24 bytes always holds an i64 in decimal.
    let _ = write!(cur, "{v}");
    let n = cur.position() as usize;
    &buf[..n]
}
