// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::sleep::{TimerRegistration, far_deadline};
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use pin_project::{pin_project, pinned_drop};
use std::time::Instant;

/// Requires a future to complete before `duration` has elapsed.
///
/// The deadline is checked *before* the inner future is polled, so a zero
/// duration elapses immediately without the future ever running.
///
/// ```
/// use core::time::Duration;
/// use spindle::time::timeout;
///
/// let rt = spindle::Runtime::new(1);
/// let out = rt.block_on(async {
///     timeout(Duration::from_millis(5), spindle::future::never::<u32>()).await
/// });
/// assert!(out.is_err());
/// ```
pub fn timeout<F>(duration: Duration, future: F) -> Timeout<F::IntoFuture>
where
    F: IntoFuture,
{
    timeout_at(far_deadline(duration), future)
}

/// Requires a future to complete before `deadline` has been reached.
pub fn timeout_at<F>(deadline: Instant, future: F) -> Timeout<F::IntoFuture>
where
    F: IntoFuture,
{
    Timeout {
        future: future.into_future(),
        expiry: deadline,
        id: 0,
        registration: TimerRegistration::new(),
    }
}

/// Future returned by [`timeout`] and [`timeout_at`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<F> {
    #[pin]
    future: F,
    expiry: Instant,
    id: u64,
    registration: TimerRegistration,
}

/// The deadline of a [`Timeout`] passed before its inner future completed.
#[derive(Debug, PartialEq, Eq)]
pub struct Elapsed(pub(crate) ());

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deadline has elapsed")
    }
}

impl core::error::Error for Elapsed {}

impl<F> Timeout<F> {
    /// Gets a reference to the underlying future in this timeout.
    pub fn get_ref(&self) -> &F {
        &self.future
    }

    /// Gets a mutable reference to the underlying future in this timeout.
    pub fn get_mut(&mut self) -> &mut F {
        &mut self.future
    }

    /// Consumes this timeout, returning the underlying future.
    pub fn into_inner(self) -> F {
        let mut this = core::mem::ManuallyDrop::new(self);
        // Safety: `this` is wrapped in `ManuallyDrop` so the struct's
        // `PinnedDrop` impl never runs; we replicate its deregistration
        // logic here, then read each field out exactly once before the
        // `ManuallyDrop` wrapper is discarded without running drop glue.
        unsafe {
            this.registration.deregister(this.expiry, this.id);
            let future = core::ptr::read(&this.future);
            core::ptr::drop_in_place(&mut this.registration);
            future
        }
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let now = Instant::now();

        if now >= *this.expiry {
            this.registration.deregister(*this.expiry, *this.id);
            *this.id = 0;
            return Poll::Ready(Err(Elapsed(())));
        }

        if let Poll::Ready(v) = this.future.poll(cx) {
            this.registration.deregister(*this.expiry, *this.id);
            *this.id = 0;
            return Poll::Ready(Ok(v));
        }

        if *this.id == 0 {
            *this.id = this.registration.register(*this.expiry, cx.waker());
        }

        Poll::Pending
    }
}

#[pinned_drop]
impl<F> PinnedDrop for Timeout<F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.registration.deregister(*this.expiry, *this.id);
    }
}
