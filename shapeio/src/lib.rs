//! Token-bucket bandwidth shaping for byte streams.
//!
//! Wrap a reader or writer and its throughput stays under a ceiling you can change at any time:
//!
//! - [`shaper`]: adapters for Tokio's `AsyncRead`/`AsyncWrite`.
//! - [`blocking`]: adapters for `std::io::Read`/`std::io::Write`.
//! - [`limiter`]: the shared token bucket behind both, usable on its own.
//! - [`config`]: human-friendly rates and serde-ready settings.
//! - [`io`]: extension traits (`stream.shape_reads(rate)`).
//! - [`utils::rate_meter`]: measure what a stream actually achieved.
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use shapeio::ShapedWriter;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let mut out = ShapedWriter::new(io::stdout());
//! out.set_rate_limit(1024.0); // 1 KiB/s
//! out.write_all(b"slowly, one kibibyte per second\n").await?;
//! out.set_rate_limit(0.0); // unlimited again
//! # Ok(()) }
//! ```
pub mod blocking;
pub mod config;
pub mod error;
pub mod io;
pub mod limiter;
mod pacer;
pub mod shaper;
pub mod utils;

pub use config::{Bandwidth, ShapeConfig};
pub use error::ShapeError;
pub use limiter::RateLimiter;
pub use shaper::{ShapedReader, ShapedWriter};
