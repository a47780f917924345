// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multi-producer, single-consumer channel with optional capacity.
//!
//! A capacity of zero makes the channel a rendezvous point: every value is
//! handed directly from a parked sender to the waiting receiver, the queue
//! stays empty. A [`channel`] never holds more than `capacity` values;
//! senders beyond that park FIFO with their value until room frees up.
//!
//! Closing is ordered after delivery: a receiver always drains queued and
//! parked values before it observes [`Closed`].
//!
//! ```
//! let rt = spindle::Runtime::new(2);
//! let (tx, mut rx) = spindle::sync::mpsc::channel(8);
//!
//! let total = rt.block_on(async move {
//!     let producer = spindle::Handle::current().unwrap().spawn(async move {
//!         for i in 0..10 {
//!             tx.send(i).await.unwrap();
//!         }
//!     });
//!
//!     let mut total = 0;
//!     while let Ok(v) = rx.recv().await {
//!         total += v;
//!     }
//!     producer.await.unwrap();
//!     total
//! });
//! assert_eq!(total, 45);
//! ```

use crate::Closed;
use core::fmt;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;
use std::sync::Arc;

/// Creates a bounded channel. `capacity` zero creates a rendezvous channel.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    new_channel(Some(capacity))
}

/// Creates a channel without a capacity bound; `send` never waits.
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    new_channel(None)
}

fn new_channel<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        state: spin::Mutex::new(State {
            queue: VecDeque::new(),
            capacity,
            send_waiters: VecDeque::new(),
            recv_waiter: None,
        }),
        closed: AtomicBool::new(false),
        senders: AtomicUsize::new(1),
        next_id: AtomicU64::new(1),
    });

    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

/// The channel was closed; the unsent value is handed back.
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

/// Error returned by [`Sender::try_send`].
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The channel is at capacity (or a rendezvous channel has no waiting
    /// receiver).
    Full(T),
    Closed(T),
}

/// Error returned by [`Receiver::try_recv`].
#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

struct Shared<T> {
    state: spin::Mutex<State<T>>,
    closed: AtomicBool,
    senders: AtomicUsize,
    next_id: AtomicU64,
}

struct State<T> {
    queue: VecDeque<T>,
    capacity: Option<usize>,
    /// Senders parked with their value, FIFO.
    send_waiters: VecDeque<SendWaiter<T>>,
    /// The (single) parked receiver, with a direct-delivery slot.
    recv_waiter: Option<RecvWaiter<T>>,
}

struct SendWaiter<T> {
    id: u64,
    value: T,
    waker: Waker,
}

struct RecvWaiter<T> {
    id: u64,
    slot: Option<T>,
    waker: Waker,
}

impl<T> State<T> {
    fn has_room(&self) -> bool {
        self.capacity.is_none_or(|cap| self.queue.len() < cap)
    }

    /// Delivers directly into a waiting receiver's slot, or queues if there
    /// is room. On success, returns the receiver's waker to wake after
    /// unlocking.
    fn push(&mut self, value: T) -> Result<Option<Waker>, T> {
        if let Some(receiver) = &mut self.recv_waiter
            && receiver.slot.is_none()
        {
            receiver.slot = Some(value);
            return Ok(Some(receiver.waker.clone()));
        }

        if self.has_room() {
            self.queue.push_back(value);
            Ok(None)
        } else {
            Err(value)
        }
    }

    /// Takes the longest-parked sender's value, if any.
    fn take_parked(&mut self) -> Option<(T, Waker)> {
        let waiter = self.send_waiters.pop_front()?;
        Some((waiter.value, waiter.waker))
    }

    /// Moves parked senders' values into freed-up queue capacity; returns
    /// their wakers.
    fn refill_from_senders(&mut self) -> Vec<Waker> {
        let mut woken = Vec::new();
        while self.has_room() {
            let Some(waiter) = self.send_waiters.pop_front() else {
                break;
            };
            self.queue.push_back(waiter.value);
            woken.push(waiter.waker);
        }
        woken
    }
}

impl<T> Shared<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the channel closed and wakes everyone so they can observe it.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let wakers: Vec<Waker> = {
            let state = self.state.lock();
            let mut wakers: Vec<Waker> =
                state.send_waiters.iter().map(|w| w.waker.clone()).collect();
            if let Some(receiver) = &state.recv_waiter {
                wakers.push(receiver.waker.clone());
            }
            wakers
        };

        for waker in wakers {
            waker.wake();
        }
    }
}

// === sender ===

/// The sending half; clonable.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Sends `value`, waiting while the channel is full.
    ///
    /// Resolves to `Err` carrying the value back if the channel closes
    /// first.
    pub fn send(&self, value: T) -> SendFuture<T> {
        SendFuture {
            shared: self.shared.clone(),
            value: Some(value),
            id: 0,
        }
    }

    /// Sends without waiting.
    ///
    /// # Errors
    ///
    /// [`TrySendError::Full`] if the channel is at capacity,
    /// [`TrySendError::Closed`] if the receiver is gone.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if self.shared.is_closed() {
            return Err(TrySendError::Closed(value));
        }

        let pushed = self.shared.state.lock().push(value);
        match pushed {
            Ok(waker) => {
                if let Some(waker) = waker {
                    waker.wake();
                }
                Ok(())
            }
            Err(value) => Err(TrySendError::Full(value)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.close();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("mpsc::Sender").finish_non_exhaustive()
    }
}

/// Future returned by [`Sender::send`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct SendFuture<T> {
    shared: Arc<Shared<T>>,
    value: Option<T>,
    /// Parked-waiter id; 0 while unregistered. A registered waiter that is
    /// no longer queued had its value taken.
    id: u64,
}

impl<T> Unpin for SendFuture<T> {}

impl<T> Future for SendFuture<T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.shared.state.lock();

        if this.id != 0 {
            let pos = state
                .send_waiters
                .iter()
                .position(|waiter| waiter.id == this.id);
            return match pos {
                // our value was taken (queued or handed to the receiver)
                None => {
                    this.id = 0;
                    Poll::Ready(Ok(()))
                }
                Some(pos) => {
                    if this.shared.is_closed() {
                        let waiter = state.send_waiters.remove(pos).expect("index is valid");
                        this.id = 0;
                        return Poll::Ready(Err(SendError(waiter.value)));
                    }
                    let waiter = &mut state.send_waiters[pos];
                    if !waiter.waker.will_wake(cx.waker()) {
                        waiter.waker = cx.waker().clone();
                    }
                    Poll::Pending
                }
            };
        }

        let value = this.value.take().expect("send future polled after completion");

        if this.shared.is_closed() {
            return Poll::Ready(Err(SendError(value)));
        }

        match state.push(value) {
            Ok(waker) => {
                drop(state);
                if let Some(waker) = waker {
                    waker.wake();
                }
                Poll::Ready(Ok(()))
            }
            Err(value) => {
                let id = this.shared.next_id.fetch_add(1, Ordering::Relaxed);
                state.send_waiters.push_back(SendWaiter {
                    id,
                    value,
                    waker: cx.waker().clone(),
                });
                this.id = id;
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for SendFuture<T> {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }
        // cancelled mid-wait: reclaim (and drop) the parked value
        let mut state = self.shared.state.lock();
        if let Some(pos) = state.send_waiters.iter().position(|w| w.id == self.id) {
            state.send_waiters.remove(pos);
        }
    }
}

// === receiver ===

/// The receiving half; at most one exists per channel.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Receives the next value, waiting while the channel is empty.
    ///
    /// Resolves to `Err(`[`Closed`]`)` only once every queued and parked
    /// value has been drained.
    pub fn recv(&mut self) -> RecvFuture<'_, T> {
        RecvFuture {
            shared: &self.shared,
            id: 0,
        }
    }

    /// Receives without waiting.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] when no value is available right now,
    /// [`TryRecvError::Closed`] when additionally all senders are gone.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        let (result, wakers) = {
            let mut state = self.shared.state.lock();
            if let Some(value) = state.queue.pop_front() {
                (Ok(value), state.refill_from_senders())
            } else if let Some((value, waker)) = state.take_parked() {
                (Ok(value), vec![waker])
            } else if self.shared.is_closed() {
                (Err(TryRecvError::Closed), Vec::new())
            } else {
                (Err(TryRecvError::Empty), Vec::new())
            }
        };

        for waker in wakers {
            waker.wake();
        }
        result
    }

    /// Takes every currently queued value at once, refilling the queue from
    /// parked senders.
    pub fn drain(&mut self) -> VecDeque<T> {
        let (drained, wakers) = {
            let mut state = self.shared.state.lock();
            let drained = core::mem::take(&mut state.queue);
            (drained, state.refill_from_senders())
        };

        for waker in wakers {
            waker.wake();
        }
        drained
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("mpsc::Receiver").finish_non_exhaustive()
    }
}

/// Future returned by [`Receiver::recv`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct RecvFuture<'a, T> {
    shared: &'a Arc<Shared<T>>,
    /// Registered-receiver id; 0 while unregistered.
    id: u64,
}

impl<T> Unpin for RecvFuture<'_, T> {}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, Closed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.shared.state.lock();

        // did a sender deliver directly into our slot?
        if this.id != 0
            && let Some(receiver) = &mut state.recv_waiter
            && receiver.id == this.id
        {
            if let Some(value) = receiver.slot.take() {
                state.recv_waiter = None;
                let wakers = state.refill_from_senders();
                drop(state);
                for waker in wakers {
                    waker.wake();
                }
                this.id = 0;
                return Poll::Ready(Ok(value));
            }
        }

        if let Some(value) = state.queue.pop_front() {
            let wakers = state.refill_from_senders();
            state.recv_waiter = None;
            drop(state);
            for waker in wakers {
                waker.wake();
            }
            this.id = 0;
            return Poll::Ready(Ok(value));
        }

        // rendezvous hand-off: take the value straight from a parked sender
        if let Some((value, waker)) = state.take_parked() {
            state.recv_waiter = None;
            drop(state);
            waker.wake();
            this.id = 0;
            return Poll::Ready(Ok(value));
        }

        // drained dry: only now may closure be reported
        if this.shared.is_closed() {
            state.recv_waiter = None;
            this.id = 0;
            return Poll::Ready(Err(Closed(())));
        }

        // register (or refresh) ourselves as the waiting receiver
        match &mut state.recv_waiter {
            Some(receiver) if receiver.id == this.id => {
                if !receiver.waker.will_wake(cx.waker()) {
                    receiver.waker = cx.waker().clone();
                }
            }
            _ => {
                let id = this.shared.next_id.fetch_add(1, Ordering::Relaxed);
                state.recv_waiter = Some(RecvWaiter {
                    id,
                    slot: None,
                    waker: cx.waker().clone(),
                });
                this.id = id;
            }
        }

        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }

        let mut state = self.shared.state.lock();
        if let Some(receiver) = &mut state.recv_waiter
            && receiver.id == self.id
        {
            // a value delivered but never observed goes back to the front
            // of the queue so ordering is preserved
            if let Some(value) = receiver.slot.take() {
                if state.has_room() {
                    state.queue.push_front(value);
                } else {
                    tracing::warn!(
                        "recv future dropped while holding a value and the queue is full; \
                         the value is lost"
                    );
                }
            }
            state.recv_waiter = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn bounded_backpressure() {
        let (tx, mut rx) = channel(3);

        // first three fit, the fourth doesn't
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        tx.try_send(3).unwrap();
        assert_eq!(tx.try_send(4), Err(TrySendError::Full(4)));

        // the fourth parks as a send future instead
        let mut send4 = task::spawn(tx.send(4));
        assert_pending!(send4.poll());

        // receiving one frees capacity and completes the parked send
        assert_eq!(rx.try_recv(), Ok(1));
        assert!(send4.is_woken());
        assert_eq!(assert_ready!(send4.poll()), Ok(()));

        // nothing was reordered
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Ok(3));
        assert_eq!(rx.try_recv(), Ok(4));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn closed_after_receiver_drop() {
        let (tx, rx) = channel(1);
        drop(rx);
        assert_eq!(tx.try_send(5), Err(TrySendError::Closed(5)));

        let mut send = task::spawn(tx.send(6));
        assert_eq!(assert_ready!(send.poll()), Err(SendError(6)));
    }

    #[test]
    fn parked_sender_observes_closure() {
        let (tx, rx) = channel(0);

        let mut send = task::spawn(tx.send(1));
        assert_pending!(send.poll());

        drop(rx);
        assert!(send.is_woken());
        assert_eq!(assert_ready!(send.poll()), Err(SendError(1)));
    }

    #[test]
    fn queued_values_drain_before_closed() {
        let (tx, mut rx) = channel(8);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        tx.try_send(3).unwrap();
        drop(tx);

        // strictly FIFO, closed only afterwards
        let mut recv = task::spawn(rx.recv());
        assert_eq!(assert_ready!(recv.poll()), Ok(1));
        drop(recv);
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Ok(3));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn rendezvous_hands_off_directly() {
        let (tx, mut rx) = channel(0);

        // no receiver waiting: a rendezvous channel has no buffer at all
        assert_eq!(tx.try_send(1), Err(TrySendError::Full(1)));

        // receiver first, then try_send delivers straight into its slot
        let mut recv = task::spawn(rx.recv());
        assert_pending!(recv.poll());
        tx.try_send(2).unwrap();
        assert!(recv.is_woken());
        assert_eq!(assert_ready!(recv.poll()), Ok(2));

        // sender first, then the receiver snatches the parked value
        let mut send = task::spawn(tx.send(3));
        assert_pending!(send.poll());
        drop(recv);
        let mut recv = task::spawn(rx.recv());
        assert_eq!(assert_ready!(recv.poll()), Ok(3));
        assert!(send.is_woken());
        assert_eq!(assert_ready!(send.poll()), Ok(()));
    }

    #[test]
    fn unbounded_never_parks() {
        let (tx, mut rx) = unbounded();
        for i in 0..1000 {
            tx.try_send(i).unwrap();
        }
        let drained = rx.drain();
        assert_eq!(drained.len(), 1000);
        assert!(drained.iter().copied().eq(0..1000));
    }

    #[test]
    fn cancelled_recv_requeues_a_delivered_value() {
        let (tx, mut rx) = channel(1);

        let mut recv = task::spawn(rx.recv());
        assert_pending!(recv.poll());

        // delivered into the receiver's slot, but the recv is dropped
        // before observing it
        tx.try_send(9).unwrap();
        drop(recv);

        // the value must not be lost
        assert_eq!(rx.try_recv(), Ok(9));
    }

    #[test]
    fn cloned_senders_keep_the_channel_open() {
        let (tx, mut rx) = channel(4);
        let tx2 = tx.clone();
        drop(tx);

        tx2.try_send(1).unwrap();
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        drop(tx2);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn multiple_producers_share_backpressure() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 100;

        let rt = crate::Runtime::new(4);
        let (tx, mut rx) = channel(4);

        let out = rt.block_on(async move {
            let producers: Vec<_> = (0..PRODUCERS)
                .map(|p| {
                    let tx = tx.clone();
                    crate::Handle::current().unwrap().spawn(async move {
                        for i in 0..PER_PRODUCER {
                            tx.send(p * PER_PRODUCER + i).await.unwrap();
                        }
                    })
                })
                .collect();
            // release the original sender so the channel closes once all
            // producers finish
            drop(tx);

            let mut received = Vec::new();
            while let Ok(v) = rx.recv().await {
                received.push(v);
            }

            for producer in producers {
                producer.await.unwrap();
            }
            received
        });

        assert_eq!(u64::try_from(out.len()).unwrap(), PRODUCERS * PER_PRODUCER);
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert!(sorted.iter().copied().eq(0..PRODUCERS * PER_PRODUCER));

        // each producer's own values arrive in its send order
        for p in 0..PRODUCERS {
            let range = (p * PER_PRODUCER)..((p + 1) * PER_PRODUCER);
            assert!(
                out.iter().copied().filter(|v| range.contains(v)).eq(range.clone()),
                "producer {p} was reordered"
            );
        }
    }

    #[test]
    fn works_across_runtime_tasks() {
        let rt = crate::Runtime::new(2);
        let (tx, mut rx) = channel(2);

        let out = rt.block_on(async move {
            let producer = crate::Handle::current().unwrap().spawn(async move {
                for i in 0..100u64 {
                    tx.send(i).await.unwrap();
                }
            });

            let mut sum = 0;
            while let Ok(v) = rx.recv().await {
                sum += v;
            }
            producer.await.unwrap();
            sum
        });

        assert_eq!(out, (0..100).sum::<u64>());
    }
}
