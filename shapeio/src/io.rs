//! Shaping extension traits.
//!
//! These blanket impls let you bolt the crate's shaping adapters straight onto any
//! `AsyncRead`/`AsyncWrite` type via ergonomic extension methods. Every method comes in a
//! **fixed-rate** flavor, which gives the adapter its own limiter, and a **shared** flavor, which
//! plugs in an existing [`RateLimiter`] so several streams draw from one budget.
//!
//! ## Fixed rate
//! ```no_run
//! use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use shapeio::io::{ShapeReadExt, ShapeWriteExt};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:12345").await?;
//! let (reader, writer) = stream.into_split();
//!
//! let mut reader = reader.shape_reads(64.0 * 1024.0);
//! let mut writer = writer.shape_writes(16.0 * 1024.0);
//!
//! writer.write_all(b"ping").await?;
//! let mut buf = [0u8; 4];
//! reader.read_exact(&mut buf).await?; // assumes the peer echoes data back
//! # Ok(()) }
//! ```
//!
//! ## Shared budget
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use shapeio::{RateLimiter, io::ShapeWriteExt};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let uplink = RateLimiter::new(1024.0 * 1024.0);
//! let mut a = TcpStream::connect("127.0.0.1:12345").await?.shape_writes_with(uplink.clone());
//! let mut b = TcpStream::connect("127.0.0.1:12346").await?.shape_writes_with(uplink.clone());
//!
//! uplink.set_rate(512.0 * 1024.0); // both streams slow down
//! a.write_all(b"one").await?;
//! b.write_all(b"two").await?;
//! # Ok(()) }
//! ```
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    limiter::RateLimiter,
    shaper::{ShapedReader, ShapedWriter},
};

/// Read-side ergonomics for the shaping adapters.
///
/// Implemented for all `AsyncRead`.
///
/// # Examples
/// ```
/// use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
/// use shapeio::io::ShapeReadExt;
///
/// # async fn example() {
/// let (mut w, r) = duplex(64);
/// let mut r = r.shape_reads(32.0);
/// w.write_all(b"hello").await.unwrap();
/// let mut buf = vec![0; 5];
/// r.read_exact(&mut buf).await.unwrap();
/// assert_eq!(&buf, b"hello");
/// # }
/// ```
pub trait ShapeReadExt: AsyncRead {
    /// Cap reads at `bytes_per_sec`. Zero, negative or non-finite rates leave the stream
    /// unlimited until [`ShapedReader::set_rate_limit`] says otherwise.
    #[must_use]
    fn shape_reads(self, bytes_per_sec: f64) -> ShapedReader<Self>
    where
        Self: Sized,
    {
        ShapedReader::with_limiter(self, RateLimiter::new(bytes_per_sec))
    }

    /// Draw read tokens from `limiter`, which may be shared with other streams.
    #[must_use]
    fn shape_reads_with(self, limiter: RateLimiter) -> ShapedReader<Self>
    where
        Self: Sized,
    {
        ShapedReader::with_limiter(self, limiter)
    }
}

impl<T: AsyncRead> ShapeReadExt for T {}

/// Write-side ergonomics for the shaping adapters.
///
/// Implemented for all `AsyncWrite`. See also [`ShapeReadExt`].
pub trait ShapeWriteExt: AsyncWrite {
    /// Cap writes at `bytes_per_sec`.
    #[must_use]
    fn shape_writes(self, bytes_per_sec: f64) -> ShapedWriter<Self>
    where
        Self: Sized,
    {
        ShapedWriter::with_limiter(self, RateLimiter::new(bytes_per_sec))
    }

    /// Draw write tokens from `limiter`, which may be shared with other streams.
    #[must_use]
    fn shape_writes_with(self, limiter: RateLimiter) -> ShapedWriter<Self>
    where
        Self: Sized,
    {
        ShapedWriter::with_limiter(self, limiter)
    }
}

impl<T: AsyncWrite> ShapeWriteExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn ext_shaped_write_then_shaped_read() {
        let (w, r) = duplex(256);
        let mut w = w.shape_writes(16.0);
        let mut r = r.shape_reads(0.0);

        let start = Instant::now();
        w.write_all(b"hello world").await.unwrap();
        w.flush().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(680));

        let mut buf = vec![0u8; 11];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
        assert!(r.limiter().is_unlimited());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_limiter_splits_one_budget() {
        let budget = RateLimiter::new(1000.0);
        let (a, mut a_rx) = duplex(4096);
        let (b, mut b_rx) = duplex(4096);
        let mut a = a.shape_writes_with(budget.clone());
        let mut b = b.shape_writes_with(budget.clone());
        assert!(a.limiter().same_bucket(b.limiter()));

        let start = Instant::now();
        let (ra, rb) = tokio::join!(a.write_all(&[1u8; 1000]), b.write_all(&[2u8; 1000]));
        ra.unwrap();
        rb.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1990));

        let mut buf = vec![0u8; 1000];
        a_rx.read_exact(&mut buf).await.unwrap();
        b_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, vec![2u8; 1000]);
    }
}
