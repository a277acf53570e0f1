//! Deadline-aware framed I/O over a duplex stream.
//!
//! [`FramedStream`] owns the raw stream plus a read buffer. Reads pull
//! bytes from the socket until the decoder produces one complete frame or
//! the deadline budget runs out; bytes beyond the first frame stay
//! buffered for the next read. The stream type is generic so tests can
//! drive the framing logic over an in-memory pipe.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::resp::parser::decode;
use crate::resp::types::Reply;

/// Initial read buffer capacity (64 KB).
const INITIAL_BUF_CAPACITY: usize = 64 * 1024;

/// Minimum spare room demanded before a socket read.
const READ_CHUNK: usize = 4096;

pub struct FramedStream<S> {
    io: S,
    /// Bytes read from the socket but not yet consumed by the decoder.
    buf: BytesMut,
    /// Growth cap for `buf`; a frame that would exceed it is a protocol error.
    max_buf_size: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    pub fn new(io: S, max_buf_size: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY.min(max_buf_size)),
            max_buf_size,
        }
    }

    /// Write `data` fully within `budget`.
    ///
    /// Small writes are the caller's to coalesce (the pipeline encoder
    /// already concatenates commands into one buffer).
    pub async fn write_all(&mut self, data: &[u8], budget: Duration) -> Result<()> {
        let deadline = Instant::now() + budget;
        let io = &mut self.io;
        let result = run_until(deadline, "write", async move {
            io.write_all(data).await?;
            io.flush().await?;
            Ok(())
        })
        .await;
        if result.is_err() {
            self.buf.clear();
        }
        result
    }

    /// Read one complete frame within `budget`.
    ///
    /// A zero budget that still has to touch the socket yields
    /// `Error::Timeout`. Protocol and I/O failures discard the buffer —
    /// the framing offset can no longer be trusted.
    pub async fn read_frame(&mut self, budget: Duration) -> Result<Reply> {
        let deadline = Instant::now() + budget;
        loop {
            if !self.buf.is_empty() {
                // Freeze the buffered bytes so bulk strings can be
                // zero-copy slices; put the tail back afterwards.
                let snapshot = self.buf.split().freeze();
                match decode(&snapshot) {
                    Ok((frame, consumed)) => {
                        if consumed < snapshot.len() {
                            self.buf.extend_from_slice(&snapshot[consumed..]);
                        }
                        return Ok(frame);
                    }
                    Err(Error::Incomplete) => {
                        self.buf.extend_from_slice(&snapshot);
                    }
                    Err(e) => {
                        self.buf.clear();
                        return Err(e);
                    }
                }
            }

            self.reserve_for_read()?;
            let io = &mut self.io;
            let buf = &mut self.buf;
            let read = run_until(deadline, "read", async move {
                Ok(io.read_buf(buf).await?)
            })
            .await;
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    // Timeouts leave the buffer intact (a later read may
                    // still complete the frame); real I/O errors discard.
                    if !matches!(e, Error::Timeout(_)) {
                        self.buf.clear();
                    }
                    return Err(e);
                }
            };
            if n == 0 {
                self.buf.clear();
                return Err(Error::Connection(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
        }
    }

    /// Grow the read buffer, refusing to pass `max_buf_size`.
    fn reserve_for_read(&mut self) -> Result<()> {
        let len = self.buf.len();
        if len >= self.max_buf_size {
            self.buf.clear();
            return Err(Error::Protocol(format!(
                "RESP frame too large: buffer would exceed {} bytes",
                self.max_buf_size
            )));
        }
        let want = READ_CHUNK.min(self.max_buf_size - len);
        if self.buf.capacity() - len < want {
            let target = (self.buf.capacity() * 2)
                .max(INITIAL_BUF_CAPACITY)
                .min(self.max_buf_size)
                .max(len + want);
            self.buf.reserve(target - len);
        }
        Ok(())
    }

    /// Leftover buffered bytes (frames already received but not yet read).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Consume the wrapper, returning the raw stream.
    pub fn into_inner(self) -> S {
        self.io
    }
}

/// Await `fut` with `deadline` as the hard stop.
async fn run_until<T>(
    deadline: Instant,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let now = Instant::now();
    if deadline <= now {
        return Err(Error::Timeout(format!("{what} deadline already elapsed")));
    }
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("{what} deadline exceeded"))),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
