// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A channel for sending a single value between two tasks.

use crate::Closed;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll, Waker};
use std::sync::Arc;

/// Creates a new oneshot channel.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        slot: spin::Mutex::new(Slot {
            value: None,
            waker: None,
        }),
        closed: AtomicBool::new(false),
    });

    (
        Sender {
            shared: Some(shared.clone()),
        },
        Receiver { shared },
    )
}

struct Shared<T> {
    slot: spin::Mutex<Slot<T>>,
    closed: AtomicBool,
}

struct Slot<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

impl<T> Shared<T> {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let waker = self.slot.lock().waker.take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Sends the single value. Dropping an unused sender closes the channel.
pub struct Sender<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> core::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("oneshot::Sender").finish_non_exhaustive()
    }
}

impl<T> Sender<T> {
    /// Sends `value` to the receiver. Never waits.
    ///
    /// # Errors
    ///
    /// Returns the value back if the receiver was dropped.
    pub fn send(mut self, value: T) -> Result<(), T> {
        let shared = self.shared.take().expect("sender used twice");

        if shared.closed.load(Ordering::Acquire) {
            return Err(value);
        }

        let waker = {
            let mut slot = shared.slot.lock();
            slot.value = Some(value);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Returns `true` if the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.closed.load(Ordering::Acquire))
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.close();
        }
    }
}

/// Receives the single value. The receiver is itself the future.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> core::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("oneshot::Receiver").finish_non_exhaustive()
    }
}

impl<T> Receiver<T> {
    /// Attempts to take the value without waiting.
    ///
    /// # Errors
    ///
    /// [`Closed`] if the sender was dropped without sending.
    pub fn try_recv(&mut self) -> Result<Option<T>, Closed> {
        let mut slot = self.shared.slot.lock();
        if let Some(value) = slot.value.take() {
            return Ok(Some(value));
        }
        drop(slot);

        if self.shared.closed.load(Ordering::Acquire) {
            Err(Closed(()))
        } else {
            Ok(None)
        }
    }
}

impl<T> Future for Receiver<T> {
    type Output = Result<T, Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();

        if let Some(value) = slot.value.take() {
            return Poll::Ready(Ok(value));
        }

        // a sent value always wins over the close that follows it, so only
        // report closure when the slot is empty
        if self.shared.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(Closed(())));
        }

        let stale = slot
            .waker
            .as_ref()
            .is_none_or(|waker| !waker.will_wake(cx.waker()));
        if stale {
            slot.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn send_then_recv() {
        let (tx, rx) = channel();
        tx.send(5).unwrap();
        let mut rx = task::spawn(rx);
        assert_eq!(assert_ready!(rx.poll()), Ok(5));
    }

    #[test]
    fn recv_waits_for_the_sender() {
        let (tx, rx) = channel();
        let mut rx = task::spawn(rx);
        assert_pending!(rx.poll());

        tx.send("hi").unwrap();
        assert!(rx.is_woken());
        assert_eq!(assert_ready!(rx.poll()), Ok("hi"));
    }

    #[test]
    fn dropped_sender_closes() {
        let (tx, rx) = channel::<u32>();
        let mut rx = task::spawn(rx);
        assert_pending!(rx.poll());

        drop(tx);
        assert!(rx.is_woken());
        assert_eq!(assert_ready!(rx.poll()), Err(Closed(())));
    }

    #[test]
    fn dropped_receiver_rejects_sends() {
        let (tx, rx) = channel();
        drop(rx);
        assert_eq!(tx.send(9), Err(9));
    }

    #[test]
    fn value_sent_before_sender_drop_is_still_received() {
        let (tx, rx) = channel();
        tx.send(1).unwrap();
        // sender is gone already; the parked value must win over closure
        let mut rx = task::spawn(rx);
        assert_eq!(assert_ready!(rx.poll()), Ok(1));
    }
}
