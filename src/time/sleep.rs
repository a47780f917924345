// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::runtime::{self, context};
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use core::time::Duration;
use std::sync::Weak;
use std::time::Instant;

/// Waits until `duration` has elapsed.
///
/// # Panics
///
/// The returned future panics when first polled outside of a runtime, or on
/// a runtime built without a time driver.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep::new(far_deadline(duration))
}

/// Waits until `deadline` has been reached.
///
/// # Panics
///
/// See [`sleep`].
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep::new(deadline)
}

pub(super) fn far_deadline(duration: Duration) -> Instant {
    let now = Instant::now();
    // saturate enormous durations ("timeout never") to roughly a century
    now.checked_add(duration)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365 * 100))
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    expiry: Instant,
    /// Timer entry id; 0 while unregistered.
    id: u64,
    registration: TimerRegistration,
}

impl Sleep {
    fn new(expiry: Instant) -> Self {
        Self {
            expiry,
            id: 0,
            registration: TimerRegistration::new(),
        }
    }

    /// The instant this sleep completes at.
    pub fn deadline(&self) -> Instant {
        self.expiry
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.expiry {
            // the driver drains the entry when it fires; nothing to clean up
            self.id = 0;
            return Poll::Ready(());
        }

        if self.id == 0 {
            let expiry = self.expiry;
            self.id = self.registration.register(expiry, cx.waker());
        }

        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.registration.deregister(self.expiry, self.id);
    }
}

/// Shared bookkeeping for timer-backed futures: resolves the current
/// runtime's time driver on first registration and removes the queued entry
/// again on drop.
///
/// Once its runtime dies, a registration parks its future forever instead
/// of failing: the waker that would complete it can no longer fire, which
/// is indistinguishable from an event that never happens.
#[derive(Debug)]
pub(super) struct TimerRegistration {
    runtime: Weak<runtime::Inner>,
    bound: bool,
}

impl TimerRegistration {
    pub(super) fn new() -> Self {
        Self {
            runtime: Weak::new(),
            bound: false,
        }
    }

    /// Adds a timer entry at `expiry`, returning its id (0 when the runtime
    /// is gone or shutting down, i.e. the future stays pending forever).
    pub(super) fn register(&mut self, expiry: Instant, waker: &Waker) -> u64 {
        let inner = if self.bound {
            let Some(inner) = self.runtime.upgrade() else {
                return 0;
            };
            inner
        } else {
            let inner = context::current_inner()
                .expect("timer future polled outside of a spindle runtime");
            self.runtime = std::sync::Arc::downgrade(&inner);
            self.bound = true;
            inner
        };

        if inner.is_shutting_down() {
            return 0;
        }

        let driver = inner
            .time_driver()
            .expect("this runtime was built without a time driver");
        driver.add_entry(expiry, waker.clone())
    }

    /// Removes the entry registered at `(expiry, id)`, unless the runtime
    /// is already gone or shutting down (its queue is cleared wholesale).
    pub(super) fn deregister(&self, expiry: Instant, id: u64) {
        if id == 0 {
            return;
        }
        if let Some(inner) = self.runtime.upgrade()
            && !inner.is_shutting_down()
            && let Some(driver) = inner.time_driver()
        {
            driver.remove_entry(expiry, id);
        }
    }
}
