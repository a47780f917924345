// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park::Parker;
use core::pin::Pin;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;

/// An async counting semaphore.
///
/// Waiters queue FIFO; released permits are assigned to the head waiter
/// first (possibly across several `release` calls for multi-permit
/// acquires), and only leftovers go back to the shared counter. A dropped
/// [`Acquire`] returns whatever permits had already been assigned to it.
#[derive(Debug)]
pub struct Semaphore {
    permits: AtomicUsize,
    waiters: spin::Mutex<VecDeque<SemWaiter>>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct SemWaiter {
    id: u64,
    /// Permits this waiter still needs. Assigned permits live in the
    /// difference to the originally requested amount.
    remaining: usize,
    waker: Waker,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
            waiters: spin::Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The number of permits currently available (not counting permits
    /// already assigned to queued waiters).
    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }

    /// Acquires `n` permits, waiting until they are available.
    pub fn acquire(&self, n: usize) -> Acquire<'_> {
        Acquire {
            semaphore: self,
            n,
            id: 0,
        }
    }

    /// Attempts to acquire `n` permits without waiting.
    pub fn try_acquire(&self, n: usize) -> bool {
        let mut current = self.permits.load(Ordering::Acquire);
        loop {
            if current < n {
                return false;
            }
            match self.permits.compare_exchange_weak(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Acquires `n` permits, blocking the calling thread. Do not call this
    /// from async code.
    pub fn acquire_blocking(&self, n: usize) {
        let parker = Parker::new();
        let waker = parker.clone().into_waker();
        let mut cx = Context::from_waker(&waker);

        let mut acquire = self.acquire(n);
        loop {
            if Pin::new(&mut acquire).poll(&mut cx).is_ready() {
                return;
            }
            parker.park();
        }
    }

    /// Returns `n` permits to the semaphore, waking queued waiters.
    pub fn release(&self, n: usize) {
        let mut n = n;
        let mut to_wake = Vec::new();

        {
            let mut waiters = self.waiters.lock();
            while n != 0 {
                let Some(head) = waiters.front_mut() else {
                    break;
                };

                let assign = n.min(head.remaining);
                head.remaining -= assign;
                n -= assign;

                if head.remaining == 0 {
                    // fully satisfied: removal from the queue is the grant
                    let head = waiters.pop_front().expect("head exists");
                    to_wake.push(head.waker);
                }
            }

            // leftovers go back to the shared counter while we still hold
            // the waiter lock, so an acquirer checking the counter under
            // that lock cannot miss them
            if n != 0 {
                self.permits.fetch_add(n, Ordering::Release);
            }
        }

        for waker in to_wake {
            waker.wake();
        }
    }
}

/// Future returned by [`Semaphore::acquire`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Acquire<'a> {
    semaphore: &'a Semaphore,
    n: usize,
    /// Waiter id; 0 while unregistered. A registered waiter that is no
    /// longer queued has been granted its permits.
    id: u64,
}

impl Future for Acquire<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sem = self.semaphore;

        if self.id == 0 {
            if sem.try_acquire(self.n) {
                return Poll::Ready(());
            }

            let mut waiters = sem.waiters.lock();

            // a release may have slipped in between the failed fast path
            // and taking the lock
            if sem.try_acquire(self.n) {
                return Poll::Ready(());
            }

            let id = sem.next_id.fetch_add(1, Ordering::Relaxed);
            waiters.push_back(SemWaiter {
                id,
                remaining: self.n,
                waker: cx.waker().clone(),
            });
            drop(waiters);
            self.id = id;
            return Poll::Pending;
        }

        let mut waiters = sem.waiters.lock();
        match waiters.iter_mut().find(|waiter| waiter.id == self.id) {
            // no longer queued: the releaser granted us all permits
            None => {
                drop(waiters);
                self.id = 0;
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

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }

        let give_back = {
            let mut waiters = self.semaphore.waiters.lock();
            match waiters.iter().position(|waiter| waiter.id == self.id) {
                Some(at) => {
                    // cancelled mid-wait: return whatever was already
                    // assigned to us
                    let waiter = waiters.remove(at).expect("index is valid");
                    self.n - waiter.remaining
                }
                // granted but never observed: return everything
                None => self.n,
            }
        };

        if give_back != 0 {
            self.semaphore.release(give_back);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn try_acquire_counts() {
        let sem = Semaphore::new(3);
        assert!(sem.try_acquire(2));
        assert!(!sem.try_acquire(2));
        assert!(sem.try_acquire(1));
        sem.release(3);
        assert_eq!(sem.available_permits(), 3);
    }

    #[test]
    fn acquire_waits_for_release() {
        let sem = Semaphore::new(1);

        let mut first = task::spawn(sem.acquire(1));
        assert_ready!(first.poll());

        let mut second = task::spawn(sem.acquire(1));
        assert_pending!(second.poll());

        sem.release(1);
        assert!(second.is_woken());
        assert_ready!(second.poll());
    }

    #[test]
    fn releases_accumulate_for_multi_permit_acquires() {
        let sem = Semaphore::new(0);

        let mut acquire = task::spawn(sem.acquire(3));
        assert_pending!(acquire.poll());

        sem.release(1);
        assert_pending!(acquire.poll());
        sem.release(1);
        assert_pending!(acquire.poll());
        sem.release(1);
        assert_ready!(acquire.poll());
    }

    #[test]
    fn waiters_are_fifo() {
        let sem = Semaphore::new(0);

        let mut first = task::spawn(sem.acquire(1));
        let mut second = task::spawn(sem.acquire(1));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        sem.release(1);
        assert!(first.is_woken());
        assert!(!second.is_woken());
        assert_ready!(first.poll());
        assert_pending!(second.poll());
    }

    #[test]
    fn cancelled_acquire_returns_assigned_permits() {
        let sem = Semaphore::new(0);

        let mut acquire = task::spawn(sem.acquire(2));
        assert_pending!(acquire.poll());

        // one of two permits assigned, then the acquire is cancelled
        sem.release(1);
        drop(acquire);

        // the assigned permit must be available again
        assert!(sem.try_acquire(1));
    }

    #[test]
    fn granted_but_dropped_acquire_releases_everything() {
        let sem = Semaphore::new(0);

        let mut acquire = task::spawn(sem.acquire(2));
        assert_pending!(acquire.poll());

        sem.release(2);
        // never polled again; dropping must give both permits back
        drop(acquire);
        assert!(sem.try_acquire(2));
    }

    #[test]
    fn bounds_concurrency_across_tasks() {
        use core::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        const TASKS: usize = 16;
        const LIMIT: usize = 2;

        let rt = crate::Runtime::new(4);
        let sem = Arc::new(Semaphore::new(LIMIT));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        rt.block_on({
            let sem = sem.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            async move {
                let handles: Vec<_> = (0..TASKS)
                    .map(|_| {
                        let sem = sem.clone();
                        let inside = inside.clone();
                        let peak = peak.clone();
                        crate::Handle::current().unwrap().spawn(async move {
                            sem.acquire(1).await;
                            let now = inside.fetch_add(1, Ordering::AcqRel) + 1;
                            peak.fetch_max(now, Ordering::AcqRel);
                            crate::task::yield_now().await;
                            inside.fetch_sub(1, Ordering::AcqRel);
                            sem.release(1);
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.await.unwrap();
                }
            }
        });

        assert!(
            peak.load(Ordering::Acquire) <= LIMIT,
            "more than {LIMIT} tasks held the semaphore at once"
        );
        assert_eq!(sem.available_permits(), LIMIT);
    }

    #[test]
    fn acquire_blocking_works_across_threads() {
        use std::sync::Arc;

        let sem = Arc::new(Semaphore::new(0));
        let releaser = {
            let sem = sem.clone();
            std::thread::spawn(move || {
                std::thread::sleep(core::time::Duration::from_millis(20));
                sem.release(1);
            })
        };

        sem.acquire_blocking(1);
        releaser.join().unwrap();
    }
}
