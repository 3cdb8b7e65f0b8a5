//! Rate-shaping adapters for Tokio `AsyncRead` and `AsyncWrite` streams.
//!
//! - [`ShapedReader`] pays for bytes **after** the inner reader produced them and only then hands
//!   them to the caller, so a source that yields less than asked is charged for what it yielded.
//! - [`ShapedWriter`] pays for a chunk **before** forwarding it to the inner writer.
//!
//! Rates are bytes per second and `0` disables shaping. Every adapter owns its own
//! [`RateLimiter`]; pass a clone to [`ShapedReader::with_limiter`] /
//! [`ShapedWriter::with_limiter`] to deliberately share one bucket.
//!
//! ## Example
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::fs::File;
//! use shapeio::shaper::{ShapedReader, ShapedWriter};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let src = File::open("/tmp/input.bin").await?;
//! let mut reader = ShapedReader::new(src);
//! reader.set_rate_limit(10.0 * 1024.0); // 10 KiB/s
//!
//! let dst = File::create("/tmp/output.bin").await?;
//! let mut writer = ShapedWriter::new(dst);
//! let knob = writer.limiter().clone();
//!
//! io::copy(&mut reader, &mut writer).await?;
//! knob.set_rate(0.0); // lift the limit from anywhere
//! writer.flush().await?;
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - Requests are cut to at most `chunk_size` bytes ([`DEFAULT_CHUNK_SIZE`] by default) so a
//!   single admission never blocks for long.
//! - The reader stages what the inner reader returned in a private buffer until the tokens for
//!   it are paid. If the wait is cancelled or the read future is dropped, the staged bytes stay
//!   put and are delivered by the next read.
//! - The writer remembers tokens paid for a chunk the inner writer has not fully accepted yet
//!   (`Pending` or a short write), so the same bytes are never paid twice.
//! - An unlimited adapter with nothing outstanding forwards calls untouched.
//! - `flush` and `shutdown` are never throttled.
use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use pin_project::pin_project;
use smallvec::SmallVec;
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf},
    sync::oneshot,
};

use crate::{
    config::{DEFAULT_CHUNK_SIZE, ShapeConfig},
    limiter::RateLimiter,
    pacer::Pacer,
};

/// Inline `IoSlice` capacity for the trimmed view built by vectored writes.
const INLINE_IOVEC: usize = 16;

/// A read-side shaper for any `AsyncRead`.
#[pin_project]
pub struct ShapedReader<T> {
    #[pin]
    inner: T,
    pacer: Pacer,
    chunk_size: usize,
    staged: Vec<u8>,
    pos: usize,
    end: usize,
    paid: bool,
}

impl<T> ShapedReader<T> {
    /// Wrap `inner` with a fresh, unlimited limiter.
    pub fn new(inner: T) -> Self {
        Self::with_limiter(inner, RateLimiter::unlimited())
    }

    /// Wrap `inner` and draw tokens from `limiter`.
    pub fn with_limiter(inner: T, limiter: RateLimiter) -> Self {
        Self {
            inner,
            pacer: Pacer::new(limiter),
            chunk_size: DEFAULT_CHUNK_SIZE,
            staged: Vec::new(),
            pos: 0,
            end: 0,
            paid: false,
        }
    }

    /// Wrap `inner` using a fresh limiter and the chunk size from `config`.
    pub fn from_config(inner: T, config: &ShapeConfig) -> Self {
        Self::with_limiter(inner, config.limiter()).with_chunk_size(config.chunk_size())
    }

    /// Cap the number of bytes pulled from the inner reader per call. `0` is treated as `1`.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Abort rate waits once `cancel` fires or its sender is dropped.
    ///
    /// A cancelled read returns an error carrying
    /// [`ShapeError::Cancelled`](crate::error::ShapeError::Cancelled) and hands out no bytes.
    #[must_use]
    pub fn with_cancel(mut self, cancel: oneshot::Receiver<()>) -> Self {
        self.pacer.set_cancel(cancel);
        self
    }

    /// Set the ceiling in bytes per second. `0` disables shaping.
    pub fn set_rate_limit(&self, bytes_per_sec: f64) {
        self.pacer.limiter().set_rate(bytes_per_sec);
    }

    pub fn rate_limit(&self) -> f64 {
        self.pacer.limiter().rate()
    }

    /// The limiter driving this reader. Clone it to change the rate while a copy borrows the
    /// reader.
    pub fn limiter(&self) -> &RateLimiter {
        self.pacer.limiter()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwrap the inner reader. Bytes staged but not yet delivered are lost.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead> AsyncRead for ShapedReader<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            // 1. deliver staged bytes once they are paid for
            if *this.pos < *this.end {
                if !*this.paid {
                    let owed = *this.end - *this.pos;
                    ready!(this.pacer.poll_admit(cx, owed)).map_err(io::Error::from)?;
                    *this.paid = true;
                }

                let n = (*this.end - *this.pos).min(buf.remaining());
                buf.put_slice(&this.staged[*this.pos..*this.pos + n]);
                *this.pos += n;
                if *this.pos == *this.end {
                    *this.pos = 0;
                    *this.end = 0;
                    *this.paid = false;
                }
                return Poll::Ready(Ok(()));
            }

            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            if this.pacer.is_idle() && this.pacer.limiter().is_unlimited() {
                return this.inner.as_mut().poll_read(cx, buf);
            }

            // 2. pull at most one chunk from the inner reader
            let want = buf.remaining().min(*this.chunk_size);
            if this.staged.len() < want {
                this.staged.resize(*this.chunk_size, 0);
            }

            let mut chunk = ReadBuf::new(&mut this.staged[..want]);
            ready!(this.inner.as_mut().poll_read(cx, &mut chunk))?;

            let got = chunk.filled().len();
            if got == 0 {
                // EOF
                return Poll::Ready(Ok(()));
            }

            // 3. loop around to pay for it
            *this.pos = 0;
            *this.end = got;
            *this.paid = false;
        }
    }
}

impl<T: AsyncWrite> AsyncWrite for ShapedReader<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }
}

impl<T: fmt::Debug> fmt::Debug for ShapedReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapedReader")
            .field("inner", &self.inner)
            .field("pacer", &self.pacer)
            .field("chunk_size", &self.chunk_size)
            .field("staged", &(self.end - self.pos))
            .finish()
    }
}

/// A write-side shaper for any `AsyncWrite`.
///
/// Each `poll_write` forwards at most one chunk; `write_all` and `io::copy` drive the rest.
#[pin_project]
pub struct ShapedWriter<T> {
    #[pin]
    inner: T,
    pacer: Pacer,
    chunk_size: usize,
    // Tokens paid for bytes the inner writer has not accepted yet.
    credit: usize,
}

impl<T> ShapedWriter<T> {
    /// Wrap `inner` with a fresh, unlimited limiter.
    pub fn new(inner: T) -> Self {
        Self::with_limiter(inner, RateLimiter::unlimited())
    }

    /// Wrap `inner` and draw tokens from `limiter`.
    pub fn with_limiter(inner: T, limiter: RateLimiter) -> Self {
        Self {
            inner,
            pacer: Pacer::new(limiter),
            chunk_size: DEFAULT_CHUNK_SIZE,
            credit: 0,
        }
    }

    /// Wrap `inner` using a fresh limiter and the chunk size from `config`.
    pub fn from_config(inner: T, config: &ShapeConfig) -> Self {
        Self::with_limiter(inner, config.limiter()).with_chunk_size(config.chunk_size())
    }

    /// Cap the number of bytes forwarded per call. `0` is treated as `1`.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Abort rate waits once `cancel` fires or its sender is dropped. The cancelled call writes
    /// nothing.
    #[must_use]
    pub fn with_cancel(mut self, cancel: oneshot::Receiver<()>) -> Self {
        self.pacer.set_cancel(cancel);
        self
    }

    /// Set the ceiling in bytes per second. `0` disables shaping.
    pub fn set_rate_limit(&self, bytes_per_sec: f64) {
        self.pacer.limiter().set_rate(bytes_per_sec);
    }

    pub fn rate_limit(&self) -> f64 {
        self.pacer.limiter().rate()
    }

    pub fn limiter(&self) -> &RateLimiter {
        self.pacer.limiter()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncBufRead> AsyncBufRead for ShapedWriter<T> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        self.project().inner.poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.project().inner.consume(amt)
    }
}

impl<T: AsyncRead> AsyncRead for ShapedWriter<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<W: AsyncWrite> AsyncWrite for ShapedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if *this.credit == 0 && this.pacer.is_idle() && this.pacer.limiter().is_unlimited() {
            return this.inner.poll_write(cx, buf);
        }

        let want = buf.len().min(*this.chunk_size);
        // A debt latched by an abandoned call may be smaller than this chunk.
        while *this.credit < want {
            let paid = ready!(this.pacer.poll_admit(cx, want - *this.credit))
                .map_err(io::Error::from)?;
            *this.credit += paid;
        }

        match this.inner.poll_write(cx, &buf[..want]) {
            Poll::Ready(Ok(n)) => {
                *this.credit = this.credit.saturating_sub(n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                // not refunded
                *this.credit = 0;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Poll::Ready(Ok(0));
        }

        if *this.credit == 0 && this.pacer.is_idle() && this.pacer.limiter().is_unlimited() {
            return this.inner.poll_write_vectored(cx, bufs);
        }

        let want = total.min(*this.chunk_size);
        // A debt latched by an abandoned call may be smaller than this chunk.
        while *this.credit < want {
            let paid = ready!(this.pacer.poll_admit(cx, want - *this.credit))
                .map_err(io::Error::from)?;
            *this.credit += paid;
        }

        // Trimmed view of the caller's buffers, inline in the common case.
        let mut remaining = want;
        let mut slices: SmallVec<[io::IoSlice<'_>; INLINE_IOVEC]> = SmallVec::new();
        for s in bufs {
            if remaining == 0 {
                break;
            }
            let take = s.len().min(remaining);
            slices.push(io::IoSlice::new(&s[..take]));
            remaining -= take;
        }

        match this.inner.poll_write_vectored(cx, &slices) {
            Poll::Ready(Ok(n)) => {
                *this.credit = this.credit.saturating_sub(n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                *this.credit = 0;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ShapedWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapedWriter")
            .field("inner", &self.inner)
            .field("pacer", &self.pacer)
            .field("chunk_size", &self.chunk_size)
            .field("credit", &self.credit)
            .finish()
    }
}
