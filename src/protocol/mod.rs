/// PostgreSQL v3 wire protocol framing
///
/// Every regular message on the wire is a one-byte type tag followed by a
/// four-byte big-endian length (inclusive of the length field itself, not the
/// tag) and the payload. The relay forwards messages without decoding their
/// payloads, so the framing layer only needs to yield `(tag, payload)` pairs
/// and write them back byte-exactly. Unknown tags are forwarded verbatim.
pub mod messages;
pub mod startup;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single message body. Large enough for bulk COPY chunks,
/// small enough to stop a corrupt length prefix from allocating the moon.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

/// Frontend (client-originated) message tags the relay inspects.
pub mod tags {
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const EXECUTE: u8 = b'E';
    pub const DESCRIBE: u8 = b'D';
    pub const CLOSE: u8 = b'C';
    pub const FLUSH: u8 = b'H';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
    pub const PASSWORD: u8 = b'p';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';
}

/// Backend (server-originated) message tags the relay inspects.
pub mod backend_tags {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
}

/// One framed protocol message: type tag plus undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u8,
    pub payload: Bytes,
}

impl Message {
    pub fn new(tag: u8, payload: Bytes) -> Self {
        Self { tag, payload }
    }

    /// Total wire size: tag + length field + payload.
    pub fn wire_len(&self) -> usize {
        1 + 4 + self.payload.len()
    }

    /// Serialize into `buf` exactly as it appears on the wire.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_len());
        buf.put_u8(self.tag);
        buf.put_u32(self.payload.len() as u32 + 4);
        buf.extend_from_slice(&self.payload);
    }
}

/// Try to split one complete framed message off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame; the
/// buffer is left untouched in that case. The payload is split off without
/// copying.
pub fn decode_frame(buf: &mut BytesMut) -> io::Result<Option<Message>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message length {} below protocol minimum", len),
        ));
    }
    let body_len = len - 4;
    if body_len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message length {} exceeds limit", body_len),
        ));
    }
    if buf.len() < 5 + body_len {
        return Ok(None);
    }
    buf.advance(5);
    let payload = buf.split_to(body_len).freeze();
    Ok(Some(Message::new(tag, payload)))
}

/// Buffered framed reader/writer over any async byte stream.
///
/// The same wrapper serves the frontend socket, backend sockets, and in-test
/// duplex pipes. Reads accumulate into an internal `BytesMut` and yield
/// complete frames; writes go through a small staging buffer so a greeting
/// of several messages flushes as one syscall.
pub struct WireStream<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WireStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(8192),
        }
    }

    /// Read the next framed message. `Ok(None)` means the peer closed the
    /// stream cleanly on a frame boundary.
    pub async fn read_message(&mut self) -> io::Result<Option<Message>> {
        loop {
            if let Some(msg) = decode_frame(&mut self.read_buf)? {
                return Ok(Some(msg));
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-message",
                ));
            }
        }
    }

    /// Stage a message for writing. Call [`flush`](Self::flush) to push it out.
    pub fn queue(&mut self, msg: &Message) {
        msg.encode_into(&mut self.write_buf);
    }

    /// Stage raw pre-framed bytes (startup packets frame themselves).
    pub fn queue_raw(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// Bytes staged but not yet flushed.
    pub fn buffered_len(&self) -> usize {
        self.write_buf.len()
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            let out = self.write_buf.split();
            self.stream.write_all(&out).await?;
        }
        self.stream.flush().await
    }

    /// Queue and flush in one step.
    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.queue(msg);
        self.flush().await
    }

    /// Read exactly `n` raw bytes, consuming buffered data first.
    pub(crate) async fn read_exact_raw(&mut self, n: usize) -> io::Result<Bytes> {
        while self.read_buf.len() < n {
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during startup",
                ));
            }
        }
        Ok(self.read_buf.split_to(n).freeze())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}
