// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::pin::Pin;
use core::sync::atomic::{AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;

/// A one-shot wakeup slot for an arbitrary number of waiters.
///
/// A notification is *not* stored: [`notify_one`](Self::notify_one) with no
/// registered waiter is lost. Waiters register on the first poll of their
/// [`Notified`] future, so the usual pattern is to create (and poll) the
/// future *before* checking the condition it waits for.
#[derive(Debug)]
pub struct Notify {
    waiters: spin::Mutex<VecDeque<NotifyWaiter>>,
    /// Waiter ids; 1-based because 0 is the "unregistered" sentinel.
    next_id: AtomicU64,
}

impl Default for Notify {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct NotifyWaiter {
    id: u64,
    waker: Waker,
}

impl Notify {
    pub fn new() -> Self {
        Self {
            waiters: spin::Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// A future completing on the next [`notify_one`](Self::notify_one)
    /// (when this waiter is first in line) or
    /// [`notify_all`](Self::notify_all) after its first poll.
    pub fn notified(&self) -> Notified<'_> {
        Notified {
            notify: self,
            id: 0,
            done: false,
        }
    }

    /// Wakes the longest-waiting registered waiter, if any.
    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().pop_front();
        if let Some(waiter) = waiter {
            waiter.waker.wake();
        }
    }

    /// Wakes every registered waiter.
    pub fn notify_all(&self) {
        let waiters: VecDeque<_> = {
            let mut lock = self.waiters.lock();
            core::mem::take(&mut *lock)
        };
        for waiter in waiters {
            waiter.waker.wake();
        }
    }
}

/// Future returned by [`Notify::notified`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Notified<'a> {
    notify: &'a Notify,
    /// Waiter id; 0 while unregistered.
    id: u64,
    done: bool,
}

impl Future for Notified<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(());
        }

        let mut waiters = self.notify.waiters.lock();

        if self.id == 0 {
            self.id = self.notify.next_id.fetch_add(1, Ordering::Relaxed);
            waiters.push_back(NotifyWaiter {
                id: self.id,
                waker: cx.waker().clone(),
            });
            return Poll::Pending;
        }

        match waiters.iter_mut().find(|waiter| waiter.id == self.id) {
            // a notifier removed our entry: that was our wakeup
            None => {
                drop(waiters);
                self.done = true;
                Poll::Ready(())
            }
            Some(waiter) => {
                if !waiter.waker.will_wake(cx.waker()) {
                    waiter.waker = cx.waker().clone();
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for Notified<'_> {
    fn drop(&mut self) {
        if self.id != 0 && !self.done {
            let mut waiters = self.notify.waiters.lock();
            if let Some(at) = waiters.iter().position(|waiter| waiter.id == self.id) {
                waiters.remove(at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn notify_one_wakes_the_first_waiter() {
        let notify = Notify::new();

        let mut first = task::spawn(notify.notified());
        let mut second = task::spawn(notify.notified());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        notify.notify_one();
        assert!(first.is_woken());
        assert!(!second.is_woken());
        assert_ready!(first.poll());
        assert_pending!(second.poll());
    }

    #[test]
    fn notify_all_wakes_everyone() {
        let notify = Notify::new();

        let mut first = task::spawn(notify.notified());
        let mut second = task::spawn(notify.notified());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        notify.notify_all();
        assert_ready!(first.poll());
        assert_ready!(second.poll());
    }

    #[test]
    fn unpolled_waiters_miss_notifications() {
        let notify = Notify::new();

        // registration happens on first poll, so this notify is lost
        let mut waiter = task::spawn(notify.notified());
        notify.notify_one();
        assert_pending!(waiter.poll());
    }

    #[test]
    fn dropped_waiters_deregister() {
        let notify = Notify::new();

        let mut first = task::spawn(notify.notified());
        assert_pending!(first.poll());
        drop(first);

        let mut second = task::spawn(notify.notified());
        assert_pending!(second.poll());

        // the dropped waiter must not swallow this
        notify.notify_one();
        assert_ready!(second.poll());
    }

    #[test]
    fn notified_is_fused() {
        let notify = Notify::new();
        let mut waiter = task::spawn(notify.notified());
        assert_pending!(waiter.poll());
        notify.notify_all();
        assert_ready!(waiter.poll());
        assert_ready!(waiter.poll());
    }
}
