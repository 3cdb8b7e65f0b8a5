//! Rate-shaping adapters for blocking `std::io::Read` and `std::io::Write` streams.
//!
//! Same contract as [`crate::shaper`], with the waiting done by parking the calling thread.
//! Don't use these on a Tokio worker thread; wrap the async stream with [`crate::shaper`]
//! instead.
//!
//! ## Example
//! ```no_run
//! use std::{fs::File, io};
//! use shapeio::blocking::ShapedWriter;
//!
//! # fn main() -> io::Result<()> {
//! let mut src = File::open("/tmp/input.bin")?;
//! let mut dst = ShapedWriter::new(File::create("/tmp/output.bin")?);
//! dst.set_rate_limit(10.0 * 1024.0); // 10 KiB/s
//! io::copy(&mut src, &mut dst)?;
//! # Ok(()) }
//! ```
//!
//! ## Error reporting
//! `std::io::Write::write` returns either a count or an error. When the inner writer fails
//! after some chunks of the same call went through, [`ShapedWriter`] returns the count and holds
//! the error back for the next call, so the error is never lost.
use std::{
    fmt,
    io::{self, Read, Write},
};

use crossbeam_channel::Receiver;

use crate::{
    config::{DEFAULT_CHUNK_SIZE, ShapeConfig},
    error::ShapeError,
    limiter::RateLimiter,
};

fn pay(limiter: &RateLimiter, cancel: Option<&Receiver<()>>, n: usize) -> Result<(), ShapeError> {
    let mut owed = n as f64;
    limiter.pay_blocking(&mut owed, cancel)
}

/// A read-side shaper for any `std::io::Read`.
pub struct ShapedReader<R> {
    inner: R,
    limiter: RateLimiter,
    chunk_size: usize,
    cancel: Option<Receiver<()>>,
    // Bytes already pulled from `inner` but not handed out yet.
    staged: Vec<u8>,
    pos: usize,
    // Tokens still owed for the staged bytes.
    owed: f64,
}

impl<R> ShapedReader<R> {
    /// Wrap `inner` with a fresh, unlimited limiter.
    pub fn new(inner: R) -> Self {
        Self::with_limiter(inner, RateLimiter::unlimited())
    }

    pub fn with_limiter(inner: R, limiter: RateLimiter) -> Self {
        Self {
            inner,
            limiter,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancel: None,
            staged: Vec::new(),
            pos: 0,
            owed: 0.0,
        }
    }

    pub fn from_config(inner: R, config: &ShapeConfig) -> Self {
        Self::with_limiter(inner, config.limiter()).with_chunk_size(config.chunk_size())
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Abort rate waits when `cancel` yields a message or all its senders are dropped.
    ///
    /// The cancelled read returns an error and keeps the bytes it had pulled from the inner
    /// reader for the next call.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Receiver<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn set_rate_limit(&self, bytes_per_sec: f64) {
        self.limiter.set_rate(bytes_per_sec);
    }

    pub fn rate_limit(&self) -> f64 {
        self.limiter.rate()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn stage(&mut self, bytes: &[u8]) {
        self.staged.clear();
        self.staged.extend_from_slice(bytes);
        self.pos = 0;
        self.owed = bytes.len() as f64;
    }
}

impl<R: Read> Read for ShapedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.pos < self.staged.len() {
            if self.owed > 0.0 {
                self.limiter.pay_blocking(&mut self.owed, self.cancel.as_ref())?;
                self.owed = 0.0;
            }

            let n = (self.staged.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.staged[self.pos..self.pos + n]);
            self.pos += n;
            if self.pos == self.staged.len() {
                self.staged.clear();
                self.pos = 0;
            }
            return Ok(n);
        }

        if self.limiter.is_unlimited() {
            return self.inner.read(buf);
        }

        let want = buf.len().min(self.chunk_size);
        let got = self.inner.read(&mut buf[..want])?;
        if got == 0 {
            return Ok(0);
        }

        let mut owed = got as f64;
        if let Err(e) = self.limiter.pay_blocking(&mut owed, self.cancel.as_ref()) {
            self.stage(&buf[..got]);
            self.owed = owed;
            return Err(e.into());
        }

        Ok(got)
    }
}

impl<R: fmt::Debug> fmt::Debug for ShapedReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapedReader")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .field("chunk_size", &self.chunk_size)
            .field("staged", &(self.staged.len() - self.pos))
            .finish()
    }
}

/// A write-side shaper for any `std::io::Write`.
///
/// One `write` call walks the whole buffer chunk by chunk, paying for each chunk before
/// forwarding it, and stops at the first short write or error.
pub struct ShapedWriter<W> {
    inner: W,
    limiter: RateLimiter,
    chunk_size: usize,
    cancel: Option<Receiver<()>>,
    // Tokens paid for bytes `inner` has not accepted yet.
    credit: usize,
    deferred: Option<io::Error>,
}

impl<W> ShapedWriter<W> {
    /// Wrap `inner` with a fresh, unlimited limiter.
    pub fn new(inner: W) -> Self {
        Self::with_limiter(inner, RateLimiter::unlimited())
    }

    pub fn with_limiter(inner: W, limiter: RateLimiter) -> Self {
        Self {
            inner,
            limiter,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancel: None,
            credit: 0,
            deferred: None,
        }
    }

    pub fn from_config(inner: W, config: &ShapeConfig) -> Self {
        Self::with_limiter(inner, config.limiter()).with_chunk_size(config.chunk_size())
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Abort rate waits when `cancel` yields a message or all its senders are dropped.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Receiver<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn set_rate_limit(&self, bytes_per_sec: f64) {
        self.limiter.set_rate(bytes_per_sec);
    }

    pub fn rate_limit(&self) -> f64 {
        self.limiter.rate()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ShapedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }

        if buf.is_empty() {
            return Ok(0);
        }

        if self.credit == 0 && self.limiter.is_unlimited() {
            return self.inner.write(buf);
        }

        let mut written = 0;
        for chunk in buf.chunks(self.chunk_size) {
            if self.credit < chunk.len() {
                match pay(&self.limiter, self.cancel.as_ref(), chunk.len() - self.credit) {
                    Ok(()) => self.credit = chunk.len(),
                    Err(e) if written == 0 => return Err(e.into()),
                    Err(e) => {
                        self.deferred = Some(e.into());
                        return Ok(written);
                    }
                }
            }

            match self.inner.write(chunk) {
                Ok(n) => {
                    self.credit = self.credit.saturating_sub(n);
                    written += n;
                    if n < chunk.len() {
                        // short write
                        return Ok(written);
                    }
                }
                Err(e) => {
                    // not refunded
                    self.credit = 0;
                    if written == 0 {
                        return Err(e);
                    }
                    self.deferred = Some(e);
                    return Ok(written);
                }
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: fmt::Debug> fmt::Debug for ShapedWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapedWriter")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .field("chunk_size", &self.chunk_size)
            .field("credit", &self.credit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        thread,
        time::{Duration, Instant},
    };

    const KIB: usize = 1024;
    const MIB: usize = 1024 * 1024;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn assert_under(limit: f64, bytes: u64, elapsed: Duration) {
        let rate = bytes as f64 / elapsed.as_secs_f64();
        assert!(
            rate <= limit * 1.01,
            "limit {limit} B/s but real rate {rate} B/s ({bytes} bytes in {elapsed:?})"
        );
    }

    /// Takes at most `per_call` bytes per write and errors once `fail_after` bytes went in.
    #[derive(Default)]
    struct Recorder {
        data: Vec<u8>,
        per_call: Option<usize>,
        fail_after: Option<usize>,
        largest_call: usize,
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_after.is_some_and(|limit| self.data.len() >= limit) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink gone"));
            }
            let mut n = buf.len().min(self.per_call.unwrap_or(usize::MAX));
            if let Some(limit) = self.fail_after {
                n = n.min(limit - self.data.len());
            }
            self.largest_call = self.largest_call.max(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Flaky {
        data: Vec<u8>,
        pos: usize,
        fail_at: usize,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.fail_at {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
            }
            let n = (self.fail_at - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn read_stays_under_the_limit() {
        for (len, limit) in [(64 * KIB, 512.0 * KIB as f64), (256 * KIB, MIB as f64)] {
            let src = vec![1u8; len];
            let mut reader = ShapedReader::new(&src[..]);
            reader.set_rate_limit(limit);

            let start = Instant::now();
            let n = io::copy(&mut reader, &mut io::sink()).unwrap();
            assert_eq!(n, len as u64);
            assert_under(limit, n, start.elapsed());
        }
    }

    #[test]
    fn write_stays_under_the_limit() {
        for (len, limit) in [(64 * KIB, 512.0 * KIB as f64), (256 * KIB, MIB as f64)] {
            let src = vec![2u8; len];
            let mut writer = ShapedWriter::new(io::sink());
            writer.set_rate_limit(limit);

            let start = Instant::now();
            let n = io::copy(&mut &src[..], &mut writer).unwrap();
            assert_eq!(n, len as u64);
            assert_under(limit, n, start.elapsed());
        }
    }

    #[test]
    fn quarter_mebibyte_at_one_mebibyte_per_second_takes_a_quarter_second() {
        let src = pattern(256 * KIB);
        let mut writer = ShapedWriter::new(Vec::new());
        writer.set_rate_limit(MIB as f64);

        let start = Instant::now();
        io::copy(&mut &src[..], &mut writer).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(245));
        assert_eq!(writer.get_ref(), &src);
    }

    #[test]
    fn unlimited_copy_is_not_delayed() {
        let src = pattern(4 * MIB);
        let mut reader = ShapedReader::new(&src[..]);
        let mut writer = ShapedWriter::new(Vec::new());

        let start = Instant::now();
        io::copy(&mut reader, &mut writer).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(writer.into_inner(), src);
    }

    #[test]
    fn single_write_is_chunked_and_delivered_intact() {
        let src = pattern(100 * KIB + 5);
        let mut writer = ShapedWriter::new(Recorder::default()).with_chunk_size(1000);
        writer.set_rate_limit(16.0 * MIB as f64);

        let n = writer.write(&src).unwrap();
        assert_eq!(n, src.len(), "one call forwards every chunk");

        let recorder = writer.into_inner();
        assert_eq!(recorder.data, src);
        assert!(recorder.largest_call <= 1000);
    }

    #[test]
    fn read_is_capped_to_chunk_size() {
        let src = pattern(10 * KIB);
        let mut reader = ShapedReader::new(&src[..]).with_chunk_size(1024);
        reader.set_rate_limit(16.0 * MIB as f64);

        let mut buf = vec![0u8; 8 * KIB];
        assert_eq!(reader.read(&mut buf).unwrap(), 1024);

        let mut out = buf[..1024].to_vec();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn short_write_stops_the_call() {
        let mut writer = ShapedWriter::new(Recorder {
            per_call: Some(300),
            ..Recorder::default()
        })
        .with_chunk_size(1000);
        writer.set_rate_limit(MIB as f64);

        assert_eq!(writer.write(&pattern(5000)).unwrap(), 300);

        writer.write_all(&pattern(5000)[300..]).unwrap();
        assert_eq!(writer.get_ref().data, pattern(5000));
    }

    #[test]
    fn write_error_after_partial_progress_is_deferred() {
        let mut writer = ShapedWriter::new(Recorder {
            fail_after: Some(2000),
            ..Recorder::default()
        })
        .with_chunk_size(1000);
        writer.set_rate_limit(MIB as f64);

        // Two chunks go through, the third fails: report the count now, the error next.
        assert_eq!(writer.write(&pattern(5000)).unwrap(), 2000);
        let err = writer.write(&pattern(5000)[2000..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(err.to_string(), "sink gone");
        assert_eq!(writer.get_ref().data, pattern(2000));
    }

    #[test]
    fn write_all_reports_exact_count_and_same_error() {
        let mut writer = ShapedWriter::new(Recorder {
            fail_after: Some(2500),
            ..Recorder::default()
        })
        .with_chunk_size(1000);
        writer.set_rate_limit(MIB as f64);

        let err = writer.write_all(&pattern(10_000)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(writer.get_ref().data, pattern(2500));
    }

    #[test]
    fn read_error_passes_through_after_delivered_bytes() {
        let mut reader = ShapedReader::new(Flaky {
            data: pattern(100),
            pos: 0,
            fail_at: 40,
        });
        reader.set_rate_limit(MIB as f64);

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(out, pattern(40));
    }

    #[test]
    fn cancelled_read_keeps_staged_bytes() {
        let src = pattern(100);
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let mut reader = ShapedReader::new(&src[..]).with_cancel(rx);
        reader.set_rate_limit(10.0);

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(tx);
        });

        let mut buf = [0u8; 100];
        let err = reader.read(&mut buf).unwrap_err();
        canceller.join().unwrap();
        assert!(ShapeError::is_cancelled(&err));

        reader.set_rate_limit(0.0);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn cancelled_read_resumes_unpaid_remainder() {
        let src = pattern(100);
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let mut reader = ShapedReader::new(&src[..]).with_cancel(rx);
        reader.set_rate_limit(100.0);

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            tx.send(()).unwrap();
            tx
        });

        let mut buf = [0u8; 100];
        let err = reader.read(&mut buf).unwrap_err();
        let _tx = canceller.join().unwrap();
        assert!(ShapeError::is_cancelled(&err));

        // About half of the 100 tokens were paid before the cancel.
        let start = Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, src);
        assert!(start.elapsed() < Duration::from_millis(800), "took {:?}", start.elapsed());
    }

    #[test]
    fn cancel_mid_write_all_is_reported() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let mut writer = ShapedWriter::new(Recorder::default())
            .with_chunk_size(1000)
            .with_cancel(rx);
        writer.set_rate_limit(10_000.0);

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            tx.send(()).unwrap();
            tx
        });

        let err = writer.write_all(&pattern(5000)).unwrap_err();
        let _tx = canceller.join().unwrap();
        assert!(ShapeError::is_cancelled(&err));

        let data = &writer.get_ref().data;
        assert!(!data.is_empty() && data.len() < 5000, "wrote {}", data.len());
        assert_eq!(data[..], pattern(5000)[..data.len()]);
    }

    #[test]
    fn cancelled_write_transfers_nothing() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let mut writer = ShapedWriter::new(Recorder::default()).with_cancel(rx);
        writer.set_rate_limit(1.0);
        tx.send(()).unwrap();

        let err = writer.write(b"hello").unwrap_err();
        assert!(ShapeError::is_cancelled(&err));
        assert!(writer.get_ref().data.is_empty());
    }

    #[test]
    fn concurrent_set_rate_limit_while_writing() {
        let rates = [500.0 * KIB as f64, MIB as f64, 10.0 * MIB as f64, 50.0 * MIB as f64];
        let mut writer = ShapedWriter::new(io::sink());
        let deadline = Instant::now() + Duration::from_millis(300);

        let setters: Vec<_> = rates
            .iter()
            .map(|&limit| {
                let knob = writer.limiter().clone();
                thread::spawn(move || {
                    while Instant::now() < deadline {
                        knob.set_rate(limit);
                        thread::sleep(Duration::from_millis(5));
                    }
                })
            })
            .collect();

        let mut total = 0u64;
        while Instant::now() < deadline {
            for len in [4 * KIB, 16 * KIB, 64 * KIB] {
                total += io::copy(&mut &pattern(len)[..], &mut writer).unwrap();
            }
        }

        for setter in setters {
            setter.join().unwrap();
        }
        assert!(total > 0);

        writer.set_rate_limit(7.0);
        assert_eq!(writer.rate_limit(), 7.0);
    }
}
