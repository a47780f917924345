// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![expect(
    impl_trait_overcaptures,
    reason = "mycelium_bitfield is not updated to edition 2024 yet"
)]

use crate::loom::sync::atomic::{self, AtomicU64, Ordering};
use core::fmt;

/// Task state. The task stores its state in an atomic `u64` with various bitfields for the
/// necessary information. The state has the following layout:
///
/// ```text
/// | 63     8 | 7          7 | 6           6 | 5         5 | 4           4 | 3      3 | 2         2 | 1       1 | 0         0 |
/// | refcount | has handle   | registering   | notifying   | has awaiter   | closed   | completed   | running   | scheduled   |
/// ```
///
/// The rest of the bits are used for the ref-count.
pub(crate) struct State {
    val: AtomicU64,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<u64> {
        /// If set, this task is in the run queue and will be polled soon.
        pub(crate) const SCHEDULED: bool;
        /// If set, this task is currently being polled by a worker.
        pub(crate) const RUNNING: bool;
        /// If set, this task's future has completed (returned `Poll::Ready`
        /// or panicked) and the output slot is populated.
        pub(crate) const COMPLETED: bool;
        /// If set, the task's output is (or will become) unavailable: the
        /// task was aborted, its handle consumed the output, or it completed
        /// without a handle. Monotonic once set.
        pub(crate) const CLOSED: bool;
        /// If set, a waker is stored in the task's awaiter slot.
        pub(crate) const HAS_AWAITER: bool;
        /// If set, some thread is currently taking the awaiter to notify it.
        pub(crate) const NOTIFYING: bool;
        /// If set, some thread is currently storing a new awaiter.
        pub(crate) const REGISTERING: bool;
        /// If set, a `JoinHandle` for this task exists. Cleared at most once.
        pub(crate) const HAS_HANDLE: bool;
        /// The number of currently live references to this task.
        ///
        /// When this is 0, the task is deallocated.
        pub(crate) const REFS = ..;
    }
}

/// What [`Task::poll`](super::Task) should do after attempting the
/// idle → running transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub(super) enum StartPollAction {
    /// Successful transition, it's okay to poll the future.
    Poll,
    /// The task was closed before it could run again; the future must be
    /// dropped and the awaiter notified.
    Cancelled,
    /// The task is already running elsewhere or has completed; don't touch it.
    DontPoll,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub(super) enum WakeByValAction {
    /// Enqueue the task. The waker's reference is transferred into the
    /// scheduling reference, so the caller must not adjust the refcount.
    Enqueue,
    /// Nothing to schedule; release the waker's reference.
    Drop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub(super) enum WakeByRefAction {
    /// Enqueue the task. The transition already added the scheduling
    /// reference.
    Enqueue,
    /// The task does not need to be enqueued.
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub(super) enum CancelAction {
    /// The task was idle; it has been marked closed + scheduled and a
    /// scheduling reference was added. The caller must enqueue it so the
    /// worker drops the future.
    Enqueue,
    /// The task was already scheduled or running; the worker will observe
    /// the closed bit on its own.
    Closed,
    /// The task already completed or was already closed.
    NoOp,
}

const REF_ONE: u64 = Snapshot::REFS.first_bit();
const REF_MAX: u64 = Snapshot::REFS.raw_mask();

impl State {
    /// Returns a task's initial state: scheduled, with a live handle, and a
    /// single reference (owned by the run queue entry).
    pub(super) fn new() -> State {
        let initial = Snapshot::new()
            .with(Snapshot::SCHEDULED, true)
            .with(Snapshot::HAS_HANDLE, true);
        State {
            val: AtomicU64::new(initial.0 + REF_ONE),
        }
    }

    pub(super) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    pub(super) fn compare_exchange(
        &self,
        current: Snapshot,
        new: Snapshot,
    ) -> Result<Snapshot, Snapshot> {
        self.val
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(Snapshot)
            .map_err(Snapshot)
    }

    pub(super) fn fetch_or(&self, bits: Snapshot, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.fetch_or(bits.0, ordering))
    }

    pub(super) fn fetch_and(&self, mask: u64, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.fetch_and(mask, ordering))
    }

    /// Attempt to transition the task from idle to `RUNNING`; the returned
    /// enum indicates what to do with the task.
    pub(super) fn start_poll(&self) -> StartPollAction {
        self.transition(|s| {
            // cannot start polling a task which is being polled on another
            // thread, or a task which has completed
            if s.get(Snapshot::RUNNING) || s.get(Snapshot::COMPLETED) {
                return StartPollAction::DontPoll;
            }

            if s.get(Snapshot::CLOSED) {
                // consume the wakeup; the caller drops the future
                s.set(Snapshot::SCHEDULED, false);
                return StartPollAction::Cancelled;
            }

            s.set(Snapshot::SCHEDULED, false).set(Snapshot::RUNNING, true);
            StartPollAction::Poll
        })
    }

    /// Consuming wake. The waker owns one reference which is either
    /// transferred into the scheduling reference or released by the caller.
    pub(super) fn wake_by_val(&self) -> WakeByValAction {
        self.transition(|s| {
            // a completed, closed or already-scheduled task doesn't need
            // another wakeup; the waker's reference is simply released
            if s.get(Snapshot::COMPLETED) || s.get(Snapshot::CLOSED) || s.get(Snapshot::SCHEDULED) {
                return WakeByValAction::Drop;
            }

            if s.get(Snapshot::RUNNING) {
                // the worker will observe the bit at the end of its poll and
                // reschedule the task itself
                s.set(Snapshot::SCHEDULED, true);
                return WakeByValAction::Drop;
            }

            // transfer the waker's reference into the scheduling reference
            s.set(Snapshot::SCHEDULED, true);
            WakeByValAction::Enqueue
        })
    }

    /// Non-consuming wake; adds a scheduling reference when enqueueing.
    pub(super) fn wake_by_ref(&self) -> WakeByRefAction {
        self.transition(|s| {
            if s.get(Snapshot::COMPLETED) || s.get(Snapshot::CLOSED) || s.get(Snapshot::SCHEDULED) {
                return WakeByRefAction::None;
            }

            if s.get(Snapshot::RUNNING) {
                s.set(Snapshot::SCHEDULED, true);
                return WakeByRefAction::None;
            }

            *s = s.with(Snapshot::SCHEDULED, true).clone_ref();
            WakeByRefAction::Enqueue
        })
    }

    /// Mark the task closed so the next run drops the future.
    pub(super) fn cancel(&self) -> CancelAction {
        self.transition(|s| {
            if s.get(Snapshot::COMPLETED) || s.get(Snapshot::CLOSED) {
                return CancelAction::NoOp;
            }

            s.set(Snapshot::CLOSED, true);

            // if the task is neither queued nor running, schedule it once so
            // the worker gets a chance to drop the future
            if !s.get(Snapshot::SCHEDULED) && !s.get(Snapshot::RUNNING) {
                *s = s.with(Snapshot::SCHEDULED, true).clone_ref();
                CancelAction::Enqueue
            } else {
                CancelAction::Closed
            }
        })
    }

    pub(super) fn clone_ref(&self) {
        // Using a relaxed ordering is alright here, as knowledge of the
        // original reference prevents other threads from erroneously deleting
        // the object. New references to an object can only be formed from an
        // existing reference, and passing an existing reference from one
        // thread to another must already provide any required
        // synchronization.
        let old_refs = self.val.fetch_add(REF_ONE, Ordering::Relaxed);

        // Guard against massive refcounts in case someone is `mem::forget`ing
        // wakers in a loop. Such a program is incredibly degenerate and not
        // worth supporting.
        assert!(old_refs < REF_MAX, "task reference count overflow");
    }

    /// Returns `true` if this was the last reference and the task must be
    /// deallocated.
    pub(super) fn drop_ref(&self) -> bool {
        // We do not need to synchronize with other threads unless we are
        // going to delete the task.
        let old_refs = Snapshot::REFS.unpack(self.val.fetch_sub(REF_ONE, Ordering::Release));

        if old_refs > 1 {
            return false;
        }

        atomic::fence(Ordering::Acquire);
        true
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

impl Snapshot {
    pub(crate) fn ref_count(self) -> u64 {
        Snapshot::REFS.unpack(self.0)
    }

    pub(super) fn raw(self) -> u64 {
        self.0
    }

    pub(super) fn clone_ref(self) -> Self {
        Self(self.0 + REF_ONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let state = State::new();
        let s = state.load(Ordering::Relaxed);
        assert!(s.get(Snapshot::SCHEDULED));
        assert!(s.get(Snapshot::HAS_HANDLE));
        assert!(!s.get(Snapshot::RUNNING));
        assert!(!s.get(Snapshot::COMPLETED));
        assert!(!s.get(Snapshot::CLOSED));
        assert_eq!(s.ref_count(), 1);
    }

    #[test]
    fn wake_while_scheduled_is_a_noop() {
        let state = State::new();
        assert_eq!(state.wake_by_val(), WakeByValAction::Drop);
        assert_eq!(state.wake_by_ref(), WakeByRefAction::None);
    }

    #[test]
    fn wake_while_running_sets_scheduled() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPollAction::Poll);

        assert_eq!(state.wake_by_ref(), WakeByRefAction::None);
        let s = state.load(Ordering::Relaxed);
        assert!(s.get(Snapshot::SCHEDULED));
        assert!(s.get(Snapshot::RUNNING));
        // the running worker owns the reschedule, no extra reference was made
        assert_eq!(s.ref_count(), 1);
    }

    #[test]
    fn wake_idle_task_enqueues() {
        crate::loom::model(|| {
            let state = State::new();
            assert_eq!(state.start_poll(), StartPollAction::Poll);
            // finish the poll without completing; pretend the task parked
            state.transition(|s| {
                s.set(Snapshot::RUNNING, false);
            });

            assert_eq!(state.wake_by_ref(), WakeByRefAction::Enqueue);
            let s = state.load(Ordering::Relaxed);
            assert!(s.get(Snapshot::SCHEDULED));
            assert_eq!(s.ref_count(), 2);
        });
    }

    #[test]
    fn cancel_idle_task_schedules_reclaim() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        state.transition(|s| {
            s.set(Snapshot::RUNNING, false);
        });

        assert_eq!(state.cancel(), CancelAction::Enqueue);
        let s = state.load(Ordering::Relaxed);
        assert!(s.get(Snapshot::CLOSED));
        assert!(s.get(Snapshot::SCHEDULED));
        assert_eq!(s.ref_count(), 2);

        // the next start_poll observes the closed bit
        assert_eq!(state.start_poll(), StartPollAction::Cancelled);
        assert!(!state.load(Ordering::Relaxed).get(Snapshot::SCHEDULED));

        // cancelling twice is a no-op
        assert_eq!(state.cancel(), CancelAction::NoOp);
    }
}
