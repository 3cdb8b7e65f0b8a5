//! Token-bucket rate limiter shared by every shaping adapter.
//!
//! [`RateLimiter`] is a cheap, cloneable handle around one bucket. Tokens are bytes: they
//! accrue at `rate` per second up to `capacity` (one burst window worth of rate, one second by
//! default), and every admitted byte spends one token.
//!
//! ## Example
//! ```no_run
//! use shapeio::limiter::RateLimiter;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let limiter = RateLimiter::new(64.0 * 1024.0); // 64 KiB/s
//! limiter.consume(16 * 1024).await;             // waits ~250ms on an empty bucket
//!
//! let handle = limiter.clone();
//! handle.set_rate(0.0);                          // unlimited from now on, for every clone
//! limiter.consume(usize::MAX).await;             // returns immediately
//! # }
//! ```
//!
//! ## Under the hood
//! - Refill is lazy: the elapsed time since the previous access is converted to tokens whenever
//!   the bucket is touched. There is no background timer.
//! - Bucket state lives behind a single `parking_lot::Mutex` that is held only while the state
//!   is read or updated, never across a wait.
//! - A request larger than the capacity drains what is available and keeps waiting for the
//!   remainder, so it is admitted eventually instead of being rejected.
//! - Waits are sliced to at most [`MAX_WAIT_SLICE`], so a rate change made by another thread is
//!   observed within one slice by every waiter.
//! - Switching from unlimited to a limit starts the bucket empty. A transfer measured from that
//!   point therefore never beats the configured rate.
use std::{fmt, sync::Arc, thread, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use crate::error::{Result, ShapeError};

/// Default burst window: capacity equals one second of rate.
pub const DEFAULT_BURST_WINDOW: Duration = Duration::from_secs(1);

/// Upper bound for a single sleep between two bucket checks.
pub const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

const MIN_BURST_WINDOW: Duration = Duration::from_millis(1);

// Timer resolution; shorter sleeps would spin without refilling anything.
const MIN_WAIT: Duration = Duration::from_millis(1);

// Float slack below which an outstanding debt counts as paid.
const SETTLED: f64 = 1e-6;

/// Outcome of one attempt to pay an outstanding token debt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Admission {
    /// Everything owed has been paid.
    Admitted,
    /// Some tokens are still owed; check again after this long.
    Wait(Duration),
}

/// Collapse everything that is not a finite positive rate to `0.0` (unlimited).
#[inline]
fn normalize_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    burst_window: Duration,
}

impl Bucket {
    fn new(rate: f64, burst_window: Duration, now: Instant) -> Self {
        let mut bucket = Self {
            rate: 0.0,
            capacity: 0.0,
            tokens: 0.0,
            last_refill: now,
            burst_window: burst_window.max(MIN_BURST_WINDOW),
        };
        bucket.set_rate(rate, now);
        bucket
    }

    #[inline]
    fn refill(&mut self, now: Instant) {
        if self.rate == 0.0 {
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    fn set_rate(&mut self, rate: f64, now: Instant) {
        // Settle the time already elapsed at the old rate first.
        self.refill(now);

        let was_unlimited = self.rate == 0.0;
        self.rate = normalize_rate(rate);
        self.capacity = self.rate * self.burst_window.as_secs_f64();
        self.tokens = if was_unlimited {
            0.0
        } else {
            self.tokens.min(self.capacity)
        };
        self.last_refill = now;
    }

    fn take(&mut self, owed: &mut f64, now: Instant) -> Admission {
        if self.rate == 0.0 {
            *owed = 0.0;
            return Admission::Admitted;
        }

        self.refill(now);

        let grant = self.tokens.min(*owed);
        self.tokens -= grant;
        *owed -= grant;

        if *owed <= SETTLED {
            *owed = 0.0;
            return Admission::Admitted;
        }

        // Never sleep past the burst window: tokens beyond capacity would be lost.
        let cap = MAX_WAIT_SLICE.min(self.burst_window).as_secs_f64();
        let secs = (*owed / self.rate).min(cap);
        Admission::Wait(Duration::from_secs_f64(secs).max(MIN_WAIT))
    }
}

/// A shareable token bucket measured in bytes.
///
/// Clones share the same bucket; a limiter created by [`RateLimiter::new`] or
/// [`RateLimiter::unlimited`] is independent from every other one.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Create a limiter admitting `rate` bytes per second with a one second burst window.
    ///
    /// `0`, negative, NaN and infinite rates all mean unlimited.
    pub fn new(rate: f64) -> Self {
        Self::builder().rate(rate).build()
    }

    /// Create a limiter that never waits until a rate is set.
    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Atomically switch to `rate` bytes per second.
    ///
    /// Capacity becomes `rate * burst_window` and banked tokens are clamped to it. Waiters
    /// already sleeping pick up the new rate on their next check.
    pub fn set_rate(&self, rate: f64) {
        let mut bucket = self.bucket.lock();
        bucket.set_rate(rate, Instant::now());
        debug!(
            rate = bucket.rate,
            capacity = bucket.capacity,
            "rate limit updated"
        );
    }

    /// Current rate in bytes per second; `0.0` means unlimited.
    pub fn rate(&self) -> f64 {
        self.bucket.lock().rate
    }

    /// Maximum number of tokens the bucket can bank.
    pub fn capacity(&self) -> f64 {
        self.bucket.lock().capacity
    }

    pub fn burst_window(&self) -> Duration {
        self.bucket.lock().burst_window
    }

    /// Tokens available right now, after refilling.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    #[inline]
    pub fn is_unlimited(&self) -> bool {
        self.bucket.lock().rate == 0.0
    }

    /// Returns `true` when both handles drive the same bucket.
    pub fn same_bucket(&self, other: &RateLimiter) -> bool {
        Arc::ptr_eq(&self.bucket, &other.bucket)
    }

    /// Pay as much of `owed` as the bucket allows right now.
    #[inline]
    pub(crate) fn take(&self, owed: &mut f64) -> Admission {
        self.bucket.lock().take(owed, Instant::now())
    }

    /// Wait on the Tokio timer until `n` tokens have been paid.
    ///
    /// Dropping the future abandons the wait; tokens already drained are not refunded.
    pub async fn consume(&self, n: usize) {
        let mut owed = n as f64;
        while let Admission::Wait(wait) = self.take(&mut owed) {
            trace!(owed, ?wait, "waiting for tokens");
            sleep(wait).await;
        }
    }

    /// Block the current thread until `n` tokens have been paid.
    pub fn consume_blocking(&self, n: usize) {
        let mut owed = n as f64;
        // Without a cancel signal the wait cannot fail.
        let _ = self.pay_blocking(&mut owed, None);
    }

    /// Like [`consume_blocking`](Self::consume_blocking) but gives up with
    /// [`ShapeError::Cancelled`] as soon as `cancel` yields a message or every sender is dropped.
    ///
    /// Dropping all senders cancels every waiter sharing the receiver; a sent message wakes
    /// only one of them.
    pub fn consume_blocking_until(&self, n: usize, cancel: &Receiver<()>) -> Result<()> {
        let mut owed = n as f64;
        self.pay_blocking(&mut owed, Some(cancel))
    }

    /// Pay down `owed` in place, parking the thread between checks.
    ///
    /// On cancellation `owed` holds what is still unpaid, so a later call can resume the debt.
    pub(crate) fn pay_blocking(
        &self,
        owed: &mut f64,
        cancel: Option<&Receiver<()>>,
    ) -> Result<()> {
        while let Admission::Wait(wait) = self.take(owed) {
            trace!(owed = *owed, ?wait, "waiting for tokens");
            match cancel {
                None => thread::sleep(wait),
                Some(rx) => match rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        return Err(ShapeError::Cancelled);
                    }
                },
            }
        }
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bucket = self.bucket.lock();
        f.debug_struct("RateLimiter")
            .field("rate", &bucket.rate)
            .field("capacity", &bucket.capacity)
            .field("tokens", &bucket.tokens)
            .finish()
    }
}

/// Builder for a [`RateLimiter`] with a non-default burst window.
#[derive(Debug, Clone)]
pub struct RateLimiterBuilder {
    rate: f64,
    burst_window: Duration,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            rate: 0.0,
            burst_window: DEFAULT_BURST_WINDOW,
        }
    }
}

impl RateLimiterBuilder {
    /// Bytes per second; `0` means unlimited.
    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// How much time worth of tokens the bucket may bank. Clamped to at least 1ms.
    pub fn burst_window(mut self, window: Duration) -> Self {
        self.burst_window = window;
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            bucket: Arc::new(Mutex::new(Bucket::new(
                self.rate,
                self.burst_window,
                Instant::now(),
            ))),
        }
    }
}
