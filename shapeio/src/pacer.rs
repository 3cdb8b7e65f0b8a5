//! Poll-driven admission for the Tokio adapters.
//!
//! `poll_read`/`poll_write` cannot `.await`, so [`Pacer`] keeps the outstanding token debt and a
//! reusable [`Sleep`] between polls. A debt is latched by the first poll and carried across
//! `Pending` returns, dropped futures and cancelled waits until it is fully paid. The poll that
//! settles it reports the size of the debt, which is not necessarily what that poll asked for.
use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use futures::FutureExt;
use tokio::{
    sync::oneshot,
    time::{Instant, Sleep, sleep_until},
};
use tracing::trace;

use crate::{
    error::ShapeError,
    limiter::{Admission, RateLimiter},
};

pub(crate) struct Pacer {
    limiter: RateLimiter,
    // (size of the latched debt, part still unpaid)
    owed: Option<(usize, f64)>,
    // Created lazily so adapters can be built outside a runtime.
    sleep: Option<Pin<Box<Sleep>>>,
    sleeping: bool,
    cancel: Option<oneshot::Receiver<()>>,
    cancelled: bool,
}

impl Pacer {
    pub(crate) fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            owed: None,
            sleep: None,
            sleeping: false,
            cancel: None,
            cancelled: false,
        }
    }

    /// Arm a cancel signal. Firing it, or dropping its sender, fails every later rate wait.
    pub(crate) fn set_cancel(&mut self, cancel: oneshot::Receiver<()>) {
        self.cancel = Some(cancel);
        self.cancelled = false;
    }

    #[inline]
    pub(crate) fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// No debt is outstanding.
    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.owed.is_none()
    }

    fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.cancelled {
            return Poll::Ready(());
        }

        let Some(rx) = self.cancel.as_mut() else {
            return Poll::Pending;
        };

        // A value and a dropped sender both count as a cancel.
        match rx.poll_unpin(cx) {
            Poll::Ready(_) => {
                self.cancel = None;
                self.cancelled = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Pay `n` tokens, or keep paying the debt latched by an earlier call.
    ///
    /// Resolves to `Ok(size)` once the latched debt is settled, where `size` is the number of
    /// tokens that debt was opened for. Resolves to [`ShapeError::Cancelled`] if the cancel
    /// signal fires while waiting; the unpaid remainder stays latched and is paid off first by
    /// the next call.
    pub(crate) fn poll_admit(
        &mut self,
        cx: &mut Context<'_>,
        n: usize,
    ) -> Poll<Result<usize, ShapeError>> {
        let (size, mut owed) = match self.owed {
            Some(debt) => debt,
            None if n == 0 => return Poll::Ready(Ok(0)),
            None => (n, n as f64),
        };

        loop {
            if self.sleeping {
                if self.poll_cancelled(cx).is_ready() {
                    self.owed = Some((size, owed));
                    self.sleeping = false;
                    return Poll::Ready(Err(ShapeError::Cancelled));
                }

                if let Some(sleep) = self.sleep.as_mut()
                    && sleep.poll_unpin(cx).is_pending()
                {
                    self.owed = Some((size, owed));
                    return Poll::Pending;
                }
                self.sleeping = false;
            }

            match self.limiter.take(&mut owed) {
                Admission::Admitted => {
                    self.owed = None;
                    return Poll::Ready(Ok(size));
                }
                Admission::Wait(wait) => {
                    trace!(owed, ?wait, "pacing");
                    let deadline = Instant::now() + wait;
                    match self.sleep.as_mut() {
                        Some(sleep) => sleep.as_mut().reset(deadline),
                        None => self.sleep = Some(Box::pin(sleep_until(deadline))),
                    }
                    self.sleeping = true;
                }
            }
        }
    }

    /// Tokens still owed on the latched debt.
    #[cfg(test)]
    fn unpaid(&self) -> f64 {
        self.owed.map_or(0.0, |(_, owed)| owed)
    }
}

impl fmt::Debug for Pacer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pacer")
            .field("limiter", &self.limiter)
            .field("owed", &self.owed)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}
