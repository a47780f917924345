// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::pin::Pin;
use core::task::{Context, Poll};

/// Yields execution back to the runtime exactly once.
///
/// The returned future is `Pending` on its first poll and wakes itself, so
/// the task goes to the back of the run queue and every other runnable task
/// gets a chance to run before it is polled again.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.yielded {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

/// Yields execution back to the runtime only if the current task has
/// exhausted its cooperative scheduling slice.
///
/// Long-running loops should await this periodically; it is nearly free
/// while the slice budget lasts (see
/// [`should_coop_yield`](crate::runtime::should_coop_yield)) and turns into
/// a [`yield_now`] once the budget is spent.
pub fn coop_yield() -> CoopYield {
    CoopYield { yielded: false }
}

/// Future returned by [`coop_yield`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct CoopYield {
    yielded: bool,
}

impl Future for CoopYield {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // fused: once we've paid for one yield, don't yield again
        if self.yielded {
            return Poll::Ready(());
        }

        if crate::runtime::should_coop_yield() {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}
