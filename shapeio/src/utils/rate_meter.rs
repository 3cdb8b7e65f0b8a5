//! Achieved-throughput measurement.
//!
//! [`RateMeter`] wraps a reader or writer (Tokio or `std::io`) and accumulates the bytes that
//! pass through it plus the time of the first non-empty transfer, so you can check what a shaped
//! stream actually delivered.
//!
//! ## Example
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use shapeio::{ShapedWriter, utils::rate_meter::RateMeter};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let mut out = ShapedWriter::new(RateMeter::new(io::sink()));
//! out.set_rate_limit(64.0 * 1024.0);
//! out.write_all(&[0u8; 128 * 1024]).await?;
//!
//! let meter = out.get_ref();
//! assert_eq!(meter.total(), 128 * 1024);
//! println!("{:.0} B/s", meter.rate_bps().unwrap_or_default());
//! # Ok(()) }
//! ```
//!
//! The clock is Tokio's, so readings follow a paused test runtime too.
use pin_project::pin_project;
use std::{
    fmt,
    io::{self, IoSlice, Read, Write},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf},
    time::Instant,
};

/// Counts bytes flowing through the wrapped I/O in either direction.
///
/// - The timer starts only after the **first non-zero** transfer.
/// - `rate_bps()` returns `None` until at least one byte has moved.
/// - `reset()` clears counters and the start time.
#[pin_project]
pub struct RateMeter<T> {
    #[pin]
    inner: T,
    total_bytes: u64,
    start: Option<Instant>,
}

impl<T> RateMeter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            total_bytes: 0,
            start: None,
        }
    }

    /// Total bytes transferred so far (saturating).
    #[inline]
    pub fn total(&self) -> u64 {
        self.total_bytes
    }

    #[inline]
    pub fn start_instant(&self) -> Option<Instant> {
        self.start
    }

    /// Average rate since `start_instant()` in bytes per second.
    pub fn rate_bps(&self) -> Option<f64> {
        let start = self.start?;
        let elapsed = start.elapsed().as_secs_f64().max(1e-6);
        Some(self.total_bytes as f64 / elapsed)
    }

    #[inline]
    pub fn reset(&mut self) {
        self.total_bytes = 0;
        self.start = None;
    }

    #[inline]
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn record(total: &mut u64, start: &mut Option<Instant>, n: usize) {
    if n == 0 {
        return;
    }
    *total = total.saturating_add(n as u64);
    if start.is_none() {
        *start = Some(Instant::now());
    }
}

impl<T: fmt::Debug> fmt::Debug for RateMeter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateMeter")
            .field("inner", &self.inner)
            .field("total_bytes", &self.total_bytes)
            .field("start", &self.start)
            .finish()
    }
}

impl<T: AsyncRead> AsyncRead for RateMeter<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len().saturating_sub(before);
                record(this.total_bytes, this.start, n);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<T: AsyncBufRead> AsyncBufRead for RateMeter<T> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        self.project().inner.poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.project();
        record(this.total_bytes, this.start, amt);
        this.inner.consume(amt);
    }
}

impl<T: AsyncWrite> AsyncWrite for RateMeter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                record(this.total_bytes, this.start, n);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write_vectored(cx, bufs) {
            Poll::Ready(Ok(n)) => {
                record(this.total_bytes, this.start, n);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }
}

impl<T: Read> Read for RateMeter<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        record(&mut self.total_bytes, &mut self.start, n);
        Ok(n)
    }
}

impl<T: Write> Write for RateMeter<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        record(&mut self.total_bytes, &mut self.start, n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
