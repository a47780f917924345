// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spawned tasks: the schedulable, cancelable, reference-counted unit that
//! wraps a future.
//!
//! A task's entire lifecycle is driven through the flags of its atomic
//! state word:
//!
//! ```text
//! spawned: SCHEDULED | HAS_HANDLE, one reference (owned by the run queue)
//! │
//! │  a worker dequeues it, clears SCHEDULED, sets RUNNING, polls:
//! │    ├─ Pending: clear RUNNING; if SCHEDULED was re-set during the
//! │    │           poll, re-enqueue, else release the reference
//! │    └─ Ready:   clear RUNNING, set COMPLETED (+CLOSED if no handle);
//! │                record the output, wake the awaiter
//! │  abort: set CLOSED (+SCHEDULED and enqueue if idle) so the worker
//! │         drops the future on its next run
//! │  handle drop: clear HAS_HANDLE; a completed task's retained output
//! │               is discarded, an unfinished one keeps running detached
//! └─ deallocated when the reference count reaches zero
//! ```

mod builder;
mod id;
mod join_handle;
mod state;
mod yield_now;

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::runtime;
use core::any::type_name;
use core::fmt;
use core::mem::{self, MaybeUninit};
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use core::time::Duration;
use std::sync::Weak;
use std::time::Instant;

use state::{CancelAction, Snapshot, StartPollAction, State, WakeByRefAction, WakeByValAction};

pub use builder::TaskBuilder;
pub use id::Id;
pub use join_handle::{JoinError, JoinHandle};
pub use yield_now::{CoopYield, YieldNow, coop_yield, yield_now};

/// Outcome of calling [`TaskRef::poll`].
///
/// This type describes how the worker should proceed with a given task,
/// whether it needs to be rescheduled or can be dropped etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task has finished (completed, or was closed and its future was
    /// dropped), without waking a [`JoinHandle`] waker.
    ///
    /// The worker removes the task from the live set and drops its
    /// reference.
    Ready,

    /// The task has finished and a [`JoinHandle`] waker has been woken.
    ReadyJoined,

    /// The task is pending, but not woken.
    ///
    /// The worker can drop its reference, as whoever intends to wake the
    /// task later is holding a clone of its [`Waker`].
    Pending,

    /// The task has woken itself during the poll.
    ///
    /// The worker must re-enqueue the task, rather than dropping its
    /// reference.
    PendingSchedule,
}

/// A snapshot of a task's diagnostic counters.
#[derive(Debug, Clone)]
pub struct TaskStats {
    pub id: Id,
    pub name: Option<String>,
    /// How many times the task's future has been polled.
    pub polls: u64,
    /// Total time spent inside the future's `poll`.
    pub busy: Duration,
}

/// The payload of a panic that escaped a task's future.
pub type PanicPayload = Box<dyn core::any::Any + Send + 'static>;

/// A type-erased, reference-counted pointer to a spawned task.
///
/// Once spawned, a task is pinned in memory (a requirement of [`Future`]).
/// Instead of moving tasks around, the scheduler passes `TaskRef`s which are
/// just pointers to the pinned allocation, interacting with it through its
/// `VTable`. This keeps the scheduler monomorphic: spawning ten different
/// `async {}` blocks produces ten `Task<F>` instantiations but only one
/// scheduler.
///
/// `TaskRef`s are reference-counted (the count lives in the high bits of the
/// task's state word), and the task is deallocated when the last reference
/// is dropped.
#[derive(Eq, PartialEq)]
pub(crate) struct TaskRef(NonNull<Header>);

#[repr(C)]
pub(crate) struct Task<F: Future> {
    /// This must be the first field of the `Task` struct!
    header: Header,

    /// The future the task is running, or its output once completed.
    ///
    /// While `COMPLETED` is unset, the `RUNNING` bit functions as a lock for
    /// this field; it may only be accessed by the thread that set `RUNNING`
    /// (or by the sole owner of a closed, unscheduled task). Once
    /// `COMPLETED` is set, the thread that wins the `!CLOSED` → `CLOSED`
    /// CAS has exclusive access to take the output.
    stage: UnsafeCell<Stage<F>>,
}

pub(crate) struct Header {
    /// The task's state word. Accessed with atomic instructions only.
    state: State,
    /// The task vtable for this task.
    vtable: &'static VTable,
    /// The task's ID.
    id: Id,
    /// The runtime this task schedules onto. Weak so that tasks never keep
    /// a dead runtime alive.
    runtime: Weak<runtime::Inner>,
    /// The tracing span associated with this task, for debugging purposes.
    span: tracing::Span,

    /// Consumer waker waiting on completion of this task.
    ///
    /// Guarded by the `NOTIFYING`/`REGISTERING` bits of the state word: a
    /// registering thread owns the slot while `REGISTERING` is held, a
    /// notifying thread owns it when its `fetch_or(NOTIFYING)` observed
    /// neither bit set. See [`Header::register_awaiter`] and
    /// [`Header::take_awaiter`].
    awaiter: UnsafeCell<Option<Waker>>,

    /// Diagnostic counters, see [`TaskStats`].
    polls: AtomicU64,
    busy_ns: AtomicU64,
    name: spin::Mutex<Option<String>>,
}

/// The current lifecycle stage of the future: the future itself, its output
/// (or the panic payload that escaped it), or nothing.
enum Stage<F: Future> {
    Pending(F),
    Ready(Result<F::Output, PanicPayload>),
    Consumed,
}

struct VTable {
    /// Poll the future, returning a [`PollResult`] that indicates what the
    /// worker should do with the polled task.
    poll: unsafe fn(NonNull<Header>) -> PollResult,

    /// Poll the task's [`JoinHandle`] for completion, storing the output at
    /// the provided pointer if the task has completed.
    poll_join:
        unsafe fn(NonNull<Header>, NonNull<()>, &mut Context<'_>) -> Poll<Result<(), JoinError>>,

    /// Drops the task and deallocates its memory.
    deallocate: unsafe fn(NonNull<Header>),

    /// Discards a completed task's output without taking it. The caller
    /// must hold exclusive stage access (the `COMPLETED` → `+CLOSED` CAS).
    drop_output: unsafe fn(NonNull<Header>),
}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn new_allocated<F>(
        future: F,
        id: Id,
        runtime: Weak<runtime::Inner>,
        name: Option<String>,
        span: tracing::Span,
    ) -> (Self, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task = Box::new(Task::new(future, id, runtime, name, span));
        assert_eq!(task.header.state.load(Ordering::Relaxed).ref_count(), 1);
        let ptr = Box::into_raw(task);

        // Safety: we just allocated the ptr so it is never null
        let task = Self(unsafe { NonNull::new_unchecked(ptr).cast() });
        let join = JoinHandle::new(task.clone());

        (task, join)
    }

    /// Returns the task's unique identifier.
    pub(crate) fn id(&self) -> Id {
        self.header().id
    }

    /// Returns `true` when this task has run to completion.
    pub(crate) fn is_complete(&self) -> bool {
        self.state()
            .load(Ordering::Acquire)
            .get(Snapshot::COMPLETED)
    }

    /// Cancels the task: marks it closed and, if it was idle, schedules it
    /// once so a worker can drop the future.
    ///
    /// Returns `true` if this call closed the task.
    pub(crate) fn cancel(&self) -> bool {
        match self.state().cancel() {
            CancelAction::NoOp => false,
            CancelAction::Closed => {
                self.header().notify_awaiter(None);
                true
            }
            CancelAction::Enqueue => {
                // the transition added the scheduling reference for us
                Header::schedule(Self(self.0));
                self.header().notify_awaiter(None);
                true
            }
        }
    }

    pub(crate) fn poll(&self) -> PollResult {
        let poll_fn = self.header().vtable.poll;
        // Safety: called through our VTable so the pointee type matches
        unsafe { poll_fn(self.0) }
    }

    /// # Safety
    ///
    /// `T` must be the output type this task was created with.
    pub(crate) unsafe fn poll_join<T>(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<T, JoinError>> {
        let poll_join_fn = self.header().vtable.poll_join;
        let mut slot = MaybeUninit::<T>::uninit();

        // Safety: called through the VTable; the caller promises `T` is the
        // right type
        let result = unsafe { poll_join_fn(self.0, NonNull::from(&mut slot).cast::<()>(), cx) };

        // Safety: the task only returns `Ok` after writing the output into
        // the slot
        result.map(|result| result.map(|()| unsafe { slot.assume_init() }))
    }

    /// Clears the `HAS_HANDLE` bit. Called when the task's [`JoinHandle`]
    /// is dropped or has consumed the output.
    ///
    /// If the task already completed and its output was never taken, the
    /// output is discarded here.
    pub(crate) fn drop_handle(&self) {
        loop {
            let s = self.state().load(Ordering::Acquire);
            debug_assert!(s.get(Snapshot::HAS_HANDLE));

            if s.get(Snapshot::COMPLETED) && !s.get(Snapshot::CLOSED) {
                // win exclusive access to the output, then discard it
                let ns = s
                    .with(Snapshot::CLOSED, true)
                    .with(Snapshot::HAS_HANDLE, false);
                if self.state().compare_exchange(s, ns).is_ok() {
                    // Safety: the CAS above grants exclusive stage access
                    unsafe { (self.header().vtable.drop_output)(self.0) };
                    return;
                }
            } else {
                let ns = s.with(Snapshot::HAS_HANDLE, false);
                if self.state().compare_exchange(s, ns).is_ok() {
                    return;
                }
            }
        }
    }

    pub(crate) fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        *self.header().name.lock() = Some(name);
    }

    pub(crate) fn stats(&self) -> TaskStats {
        let header = self.header();
        TaskStats {
            id: header.id,
            name: header.name.lock().clone(),
            polls: header.polls.load(Ordering::Relaxed),
            busy: Duration::from_nanos(header.busy_ns.load(Ordering::Relaxed)),
        }
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: the constructor ensures the pointer is always valid while
        // at least one reference is live
        unsafe { self.0.as_ref() }
    }

    fn state(&self) -> &State {
        &self.header().state
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("addr", &self.0)
            .finish()
    }
}

impl Clone for TaskRef {
    #[inline]
    fn clone(&self) -> Self {
        self.state().clone_ref();
        Self(self.0)
    }
}

impl Drop for TaskRef {
    #[inline]
    fn drop(&mut self) {
        if !self.state().drop_ref() {
            return;
        }

        let deallocate = self.header().vtable.deallocate;
        // Safety: we observed the reference count drop to zero, so no other
        // reference to this task exists
        unsafe { deallocate(self.0) }
    }
}

// Safety: the state protocol synchronizes all accesses to the inner task
unsafe impl Send for TaskRef {}
// Safety: the state protocol synchronizes all accesses to the inner task
unsafe impl Sync for TaskRef {}

static_assertions::assert_impl_all!(TaskRef: Send, Sync);

// === impl Task ===

impl<F> Task<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    const TASK_VTABLE: VTable = VTable {
        poll: Self::poll,
        poll_join: Self::poll_join,
        deallocate: Self::deallocate,
        drop_output: Self::drop_output_erased,
    };

    fn new(
        future: F,
        id: Id,
        runtime: Weak<runtime::Inner>,
        name: Option<String>,
        span: tracing::Span,
    ) -> Self {
        Self {
            header: Header {
                state: State::new(),
                vtable: &Self::TASK_VTABLE,
                id,
                runtime,
                span,
                awaiter: UnsafeCell::new(None),
                polls: AtomicU64::new(0),
                busy_ns: AtomicU64::new(0),
                name: spin::Mutex::new(name),
            },
            stage: UnsafeCell::new(Stage::Pending(future)),
        }
    }

    /// Poll the future, returning a [`PollResult`] that indicates what the
    /// worker should do with the polled task.
    ///
    /// This is a type-erased function called through the task's `VTable`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a task of type `Self`.
    unsafe fn poll(ptr: NonNull<Header>) -> PollResult {
        // Safety: ensured by caller
        let this = unsafe { ptr.cast::<Self>().as_ref() };

        tracing::trace!(
            task.addr=?ptr,
            task.output=type_name::<F::Output>(),
            task.id=%this.header.id,
            "Task::poll",
        );

        match this.header.state.start_poll() {
            StartPollAction::Poll => {}
            StartPollAction::DontPoll => {
                tracing::warn!(task.addr=?ptr, "failed to transition to running");
                return PollResult::Ready;
            }
            StartPollAction::Cancelled => {
                // the task was closed before this run; drop the future and
                // let the awaiter observe the closed task
                this.drop_future();
                let woken = this.header.notify_awaiter(None);
                return if woken {
                    PollResult::ReadyJoined
                } else {
                    PollResult::Ready
                };
            }
        }

        // wrap the waker in `ManuallyDrop` because it is converted from the
        // existing task pointer rather than incrementing the ref count. If
        // this waker were dropped at the end of the poll, it would decrement
        // a reference it never owned.
        let waker = {
            let raw = Header::raw_waker(ptr.as_ptr());
            // Safety: the raw waker vtable upholds the RawWaker contract
            mem::ManuallyDrop::new(unsafe { Waker::from_raw(raw) })
        };

        this.header.polls.fetch_add(1, Ordering::Relaxed);
        let begin = Instant::now();

        let poll = {
            let mut cx = Context::from_waker(&waker);
            // Safety: the RUNNING bit grants exclusive access to the stage
            unsafe { this.poll_stage(&mut cx) }
        };

        let busy = u64::try_from(begin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        this.header.busy_ns.fetch_add(busy, Ordering::Relaxed);

        if poll.is_ready() {
            this.end_poll_completed(ptr)
        } else {
            this.end_poll_pending(ptr)
        }
    }

    /// Completion transition: clear `RUNNING`/`SCHEDULED`, set `COMPLETED`
    /// (plus `CLOSED` when no handle exists), discard the output when nobody
    /// can take it, wake the awaiter.
    fn end_poll_completed(&self, ptr: NonNull<Header>) -> PollResult {
        loop {
            let s = self.header.state.load(Ordering::Acquire);
            debug_assert!(s.get(Snapshot::RUNNING));

            let mut ns = s
                .with(Snapshot::RUNNING, false)
                .with(Snapshot::SCHEDULED, false)
                .with(Snapshot::COMPLETED, true);
            let drop_output = !s.get(Snapshot::HAS_HANDLE) || s.get(Snapshot::CLOSED);
            if !s.get(Snapshot::HAS_HANDLE) {
                ns.set(Snapshot::CLOSED, true);
            }

            if self.header.state.compare_exchange(s, ns).is_ok() {
                tracing::trace!(task.addr=?ptr, task.id=%self.header.id, "task completed");
                if drop_output {
                    self.drop_output();
                }
                let woken = self.header.notify_awaiter(None);
                return if woken {
                    PollResult::ReadyJoined
                } else {
                    PollResult::Ready
                };
            }
        }
    }

    /// Pending transition: release `RUNNING`; if the task was closed during
    /// the poll drop the future, if it was woken during the poll reschedule
    /// it.
    fn end_poll_pending(&self, ptr: NonNull<Header>) -> PollResult {
        loop {
            let s = self.header.state.load(Ordering::Acquire);
            debug_assert!(s.get(Snapshot::RUNNING));

            let closed = s.get(Snapshot::CLOSED);
            if closed {
                // drop the future before releasing RUNNING, so an awaiter
                // that observes the closed, idle task never races a live
                // future
                self.drop_future();
            }

            let mut ns = s.with(Snapshot::RUNNING, false);
            if closed {
                ns.set(Snapshot::SCHEDULED, false);
            }

            if self.header.state.compare_exchange(s, ns).is_ok() {
                if closed {
                    tracing::trace!(task.addr=?ptr, task.id=%self.header.id, "task closed during poll");
                    let woken = self.header.notify_awaiter(None);
                    return if woken {
                        PollResult::ReadyJoined
                    } else {
                        PollResult::Ready
                    };
                }
                if s.get(Snapshot::SCHEDULED) {
                    return PollResult::PendingSchedule;
                }
                return PollResult::Pending;
            }
        }
    }

    /// Poll to join the task pointed to by `ptr`, taking its output if it
    /// has completed. Called by [`JoinHandle`]s through the task's `VTable`.
    ///
    /// This never drives the future itself: it only registers the caller's
    /// waker as the task's awaiter and inspects the completion flags.
    ///
    /// # Safety
    ///
    /// - `ptr` must point to the [`Header`] of a task of type `Self`.
    /// - `outptr` must point to a valid `MaybeUninit<F::Output>`.
    unsafe fn poll_join(
        ptr: NonNull<Header>,
        outptr: NonNull<()>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), JoinError>> {
        // Safety: ensured by caller
        let this = unsafe { ptr.cast::<Self>().as_ref() };

        tracing::trace!(
            task.addr=?ptr,
            task.id=%this.header.id,
            "Task::poll_join",
        );

        loop {
            let s = this.header.state.load(Ordering::Acquire);

            if s.get(Snapshot::CLOSED) {
                // wait until the worker has dropped the future, so the
                // cancellation is fully observable once the handle resolves
                if s.get(Snapshot::SCHEDULED) || s.get(Snapshot::RUNNING) {
                    this.header.register_awaiter(cx.waker());

                    let s = this.header.state.load(Ordering::Acquire);
                    if s.get(Snapshot::SCHEDULED) || s.get(Snapshot::RUNNING) {
                        return Poll::Pending;
                    }
                }

                this.header.notify_awaiter(Some(cx.waker()));
                return Poll::Ready(Err(JoinError::cancelled(this.header.id)));
            }

            if !s.get(Snapshot::COMPLETED) {
                this.header.register_awaiter(cx.waker());

                // reload the state after registering, to be aware of any
                // completion or closure that raced the registration
                let s = this.header.state.load(Ordering::Acquire);
                if !s.get(Snapshot::CLOSED) && !s.get(Snapshot::COMPLETED) {
                    return Poll::Pending;
                }
                continue;
            }

            // completed: win exclusive access to the output
            if this
                .header
                .state
                .compare_exchange(s, s.with(Snapshot::CLOSED, true))
                .is_ok()
            {
                // Safety: the CAS above grants exclusive stage access, and
                // the caller promised `outptr` points to a
                // `MaybeUninit<F::Output>`
                let result = unsafe { this.take_output(outptr) };
                this.header.notify_awaiter(Some(cx.waker()));
                return Poll::Ready(result);
            }
        }
    }

    /// Drops the task and deallocates its memory.
    ///
    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a task of type `Self`, and the
    /// reference count must be zero.
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            debug_assert_eq!(
                ptr.as_ref().state.load(Ordering::Acquire).ref_count(),
                0,
                "a task may not be deallocated while references exist"
            );
            drop(Box::from_raw(ptr.cast::<Self>().as_ptr()));
        }
    }

    /// Type-erased output discard, used by [`TaskRef::drop_handle`].
    unsafe fn drop_output_erased(ptr: NonNull<Header>) {
        // Safety: ensured by caller (exclusive stage access)
        let this = unsafe { ptr.cast::<Self>().as_ref() };
        this.drop_output();
    }

    /// Polls the future. If the future completes or panics, the output is
    /// written to the stage field.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the stage (the `RUNNING`
    /// bit).
    unsafe fn poll_stage(&self, cx: &mut Context<'_>) -> Poll<()> {
        let _span = self.header.span.enter();

        self.stage.with_mut(|stage| {
            // Safety: ensured by caller
            let stage = unsafe { &mut *stage };
            stage.poll(cx)
        })
    }

    /// Drops the future in place. Idempotent; requires the same exclusive
    /// access as [`Self::poll_stage`].
    fn drop_future(&self) {
        self.stage.with_mut(|stage| {
            // Safety: callers hold the RUNNING bit or are the sole owner of
            // a closed, unscheduled task
            let stage = unsafe { &mut *stage };
            if matches!(stage, Stage::Pending(_)) {
                *stage = Stage::Consumed;
            }
        });
    }

    /// Drops a completed task's output without taking it. Requires exclusive
    /// stage access (the completion CAS).
    fn drop_output(&self) {
        self.stage.with_mut(|stage| {
            // Safety: ensured by caller
            let stage = unsafe { &mut *stage };
            if matches!(stage, Stage::Ready(_)) {
                *stage = Stage::Consumed;
            }
        });
    }

    /// Moves the output (or the panic that replaced it) out of the stage.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive stage access and `dst` must point to a
    /// valid `MaybeUninit<F::Output>`.
    unsafe fn take_output(&self, dst: NonNull<()>) -> Result<(), JoinError> {
        self.stage.with_mut(|stage| {
            // Safety: ensured by caller
            let stage = unsafe { &mut *stage };
            match mem::replace(stage, Stage::Consumed) {
                Stage::Ready(Ok(output)) => {
                    // Safety: the caller promised dst points to a
                    // `MaybeUninit<F::Output>`
                    unsafe {
                        dst.cast::<MaybeUninit<F::Output>>().as_mut().write(output);
                    }
                    Ok(())
                }
                Stage::Ready(Err(payload)) => Err(JoinError::panicked(self.header.id, payload)),
                _ => panic!("JoinHandle polled after completion"),
            }
        })
    }
}

// === impl Stage ===

impl<F: Future> Stage<F> {
    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        struct Guard<'a, T: Future> {
            stage: &'a mut Stage<T>,
        }
        impl<T: Future> Drop for Guard<'_, T> {
            fn drop(&mut self) {
                // If the future panics on poll, it is dropped inside the
                // panic guard.
                *self.stage = Stage::Consumed;
            }
        }

        let poll = std::panic::catch_unwind(AssertUnwindSafe(|| -> Poll<F::Output> {
            let guard = Guard { stage: self };

            let Stage::Pending(future) = guard.stage else {
                unreachable!("unexpected stage");
            };

            // Safety: the task allocation is pinned for its whole lifetime
            let future = unsafe { Pin::new_unchecked(future) };
            let res = future.poll(cx);
            mem::forget(guard);
            res
        }));

        match poll {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(ready)) => {
                *self = Stage::Ready(Ok(ready));
                Poll::Ready(())
            }
            Err(payload) => {
                *self = Stage::Ready(Err(payload));
                Poll::Ready(())
            }
        }
    }
}

// === impl Header ===

impl Header {
    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::waker_clone,
        Self::waker_wake,
        Self::waker_wake_by_ref,
        Self::waker_drop,
    );

    // `Waker::will_wake` is used all over the place to avoid re-cloning
    // wakers that already point at the right task. `will_wake` only checks
    // pointer equality, and if this constructor were inlined (and the vtable
    // with it) the waker identity would differ before and after `.clone()`.
    // The `inline(never)` below is therefore quite load-bearing.
    #[inline(never)]
    pub(crate) fn raw_waker(this: *const Header) -> RawWaker {
        RawWaker::new(this.cast::<()>(), &Self::WAKER_VTABLE)
    }

    fn schedule(task: TaskRef) {
        if let Some(rt) = task.header().runtime.upgrade() {
            rt.enqueue(task);
        }
        // a task whose runtime is gone simply drops the scheduling
        // reference; nothing will ever poll it again
    }

    /// Stores `waker` as this task's awaiter, interlocked against concurrent
    /// notification via the `REGISTERING`/`NOTIFYING` bits.
    ///
    /// If a notification is in flight, the waker is woken immediately
    /// instead of being stored; if a notification arrives while the store is
    /// in progress, the freshly stored waker is taken back out and woken.
    /// This guarantees no wakeup is ever lost.
    pub(crate) fn register_awaiter(&self, waker: &Waker) {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s.get(Snapshot::NOTIFYING) {
                // someone is about to call the old awaiter; don't store,
                // just make sure we get polled again
                waker.wake_by_ref();
                return;
            }
            if self
                .state
                .compare_exchange(s, s.with(Snapshot::REGISTERING, true))
                .is_ok()
            {
                break;
            }
        }

        // we now hold REGISTERING: exclusive access to the awaiter slot
        self.awaiter.with_mut(|slot| {
            // Safety: guarded by the REGISTERING bit
            let slot = unsafe { &mut *slot };
            match slot {
                Some(old) if old.will_wake(waker) => {}
                _ => *slot = Some(waker.clone()),
            }
        });

        let mut consumed: Option<Waker> = None;
        loop {
            let s = self.state.load(Ordering::Acquire);

            // a notification arrived while we were storing; we must deliver
            // it ourselves
            if s.get(Snapshot::NOTIFYING) && consumed.is_none() {
                consumed = self.awaiter.with_mut(|slot| {
                    // Safety: still guarded by the REGISTERING bit
                    unsafe { (*slot).take() }
                });
            }

            let ns = s
                .with(Snapshot::NOTIFYING, false)
                .with(Snapshot::REGISTERING, false)
                .with(Snapshot::HAS_AWAITER, consumed.is_none());
            if self.state.compare_exchange(s, ns).is_ok() {
                break;
            }
        }

        if let Some(waker) = consumed {
            waker.wake();
        }
    }

    /// Takes the stored awaiter for notification.
    ///
    /// Returns `None` if another thread is currently registering or
    /// notifying (that thread will deliver the wakeup), or if the stored
    /// waker equals `current` (no point waking the caller itself).
    fn take_awaiter(&self, current: Option<&Waker>) -> Option<Waker> {
        let s = self.state.fetch_or(
            Snapshot::new().with(Snapshot::NOTIFYING, true),
            Ordering::AcqRel,
        );
        if s.get(Snapshot::NOTIFYING) || s.get(Snapshot::REGISTERING) {
            return None;
        }

        let waker = self.awaiter.with_mut(|slot| {
            // Safety: our fetch_or observed neither NOTIFYING nor
            // REGISTERING, granting exclusive slot access
            unsafe { (*slot).take() }
        });

        let mask = !Snapshot::new()
            .with(Snapshot::NOTIFYING, true)
            .with(Snapshot::HAS_AWAITER, true)
            .raw();
        self.state.fetch_and(mask, Ordering::Release);

        match (waker, current) {
            (Some(w), Some(cur)) if w.will_wake(cur) => None,
            (waker, _) => waker,
        }
    }

    /// Wakes the stored awaiter, if any. Returns `true` if a waker was
    /// actually woken.
    pub(crate) fn notify_awaiter(&self, current: Option<&Waker>) -> bool {
        if let Some(waker) = self.take_awaiter(current) {
            waker.wake();
            true
        } else {
            false
        }
    }

    // === Waker vtable methods ===

    unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
        let header = ptr.cast::<Header>();
        // Safety: called through the RawWakerVTable, ptr is a live Header
        unsafe { (*header).state.clone_ref() };
        Self::raw_waker(header)
    }

    unsafe fn waker_wake(ptr: *const ()) {
        // Safety: called through the RawWakerVTable, ptr is a live Header
        let header = unsafe { &*ptr.cast::<Header>() };
        tracing::trace!(task.id=%header.id, "Task::wake_by_val");

        match header.state.wake_by_val() {
            WakeByValAction::Enqueue => {
                // the waker's reference is transferred into the scheduling
                // reference, so construct the TaskRef without incrementing
                // Safety: ptr is non-null (it came from a live waker)
                let task = TaskRef(unsafe { NonNull::new_unchecked(ptr.cast_mut().cast()) });
                Self::schedule(task);
            }
            WakeByValAction::Drop => {
                // Safety: as above
                unsafe { Self::drop_ref(NonNull::new_unchecked(ptr.cast_mut().cast())) };
            }
        }
    }

    unsafe fn waker_wake_by_ref(ptr: *const ()) {
        // Safety: called through the RawWakerVTable, ptr is a live Header
        let header = unsafe { &*ptr.cast::<Header>() };
        tracing::trace!(task.id=%header.id, "Task::wake_by_ref");

        if header.state.wake_by_ref() == WakeByRefAction::Enqueue {
            // the transition added the scheduling reference
            // Safety: ptr is non-null (it came from a live waker)
            let task = TaskRef(unsafe { NonNull::new_unchecked(ptr.cast_mut().cast()) });
            Self::schedule(task);
        }
    }

    unsafe fn waker_drop(ptr: *const ()) {
        // Safety: called through the RawWakerVTable, ptr is a live Header
        unsafe { Self::drop_ref(NonNull::new_unchecked(ptr.cast_mut().cast())) };
    }

    unsafe fn drop_ref(ptr: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            if !ptr.as_ref().state.drop_ref() {
                return;
            }
            let deallocate = ptr.as_ref().vtable.deallocate;
            deallocate(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;
    use std::sync::Weak;

    fn make_task<F>(future: F) -> (TaskRef, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        TaskRef::new_allocated(future, Id::next(), Weak::new(), None, tracing::Span::none())
    }

    #[test]
    fn refcounts_balance() {
        let (task, handle) = make_task(async { 1u32 });
        // queue reference + handle reference
        assert_eq!(task.state().load(Ordering::Relaxed).ref_count(), 2);
        drop(handle);
        assert_eq!(task.state().load(Ordering::Relaxed).ref_count(), 1);
        drop(task);
    }

    #[test]
    fn ready_future_completes_and_output_is_taken() {
        let (task, handle) = make_task(async { 7u32 });

        assert_eq!(task.poll(), PollResult::Ready);
        let s = task.state().load(Ordering::Relaxed);
        assert!(s.get(Snapshot::COMPLETED));
        assert!(!s.get(Snapshot::CLOSED));

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        // Safety: output type matches
        let out = unsafe { task.poll_join::<u32>(&mut cx) };
        assert!(matches!(out, Poll::Ready(Ok(7))));

        drop(handle);
        drop(task);
    }

    #[test]
    fn completion_without_handle_discards_output() {
        let (task, handle) = make_task(async { String::from("dropped") });
        drop(handle);

        assert_eq!(task.poll(), PollResult::Ready);
        let s = task.state().load(Ordering::Relaxed);
        assert!(s.get(Snapshot::COMPLETED));
        assert!(s.get(Snapshot::CLOSED));
        drop(task);
    }

    #[test]
    fn panic_is_captured_as_join_error() {
        let (task, handle) = make_task(async { panic!("boom") });

        assert_eq!(task.poll(), PollResult::Ready);

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        // Safety: output type matches
        let out = unsafe { task.poll_join::<()>(&mut cx) };
        match out {
            Poll::Ready(Err(err)) => assert!(err.is_panic()),
            other => panic!("expected panic join error, got {other:?}"),
        }

        drop(handle);
        drop(task);
    }

    #[test]
    fn cancel_before_run_drops_future() {
        struct SetOnDrop(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());
        let (task, handle) = make_task(async move {
            let _guard = guard;
            futures::future::pending::<()>().await;
        });

        assert!(task.cancel());
        assert_eq!(task.poll(), PollResult::Ready);
        assert!(dropped.load(Ordering::Acquire));

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        // Safety: output type matches
        let out = unsafe { task.poll_join::<()>(&mut cx) };
        match out {
            Poll::Ready(Err(err)) => assert!(err.is_cancelled()),
            other => panic!("expected cancelled join error, got {other:?}"),
        }

        drop(handle);
        drop(task);
    }

    #[test]
    fn wake_during_poll_reschedules() {
        let (task, handle) = make_task(async {
            crate::task::yield_now().await;
        });

        // first poll: the future self-wakes, which should set SCHEDULED and
        // be reported as PendingSchedule
        assert_eq!(task.poll(), PollResult::PendingSchedule);
        // second poll completes
        assert_eq!(task.poll(), PollResult::Ready);

        drop(handle);
        drop(task);
    }

    #[test]
    fn awaiter_interlock_loses_no_wakeups() {
        // the handle registers its awaiter while another thread completes
        // the task; whatever the interleaving, the completion must reach
        // the handle
        crate::loom::model(|| {
            let (task, handle) = make_task(async { 5u32 });

            let poller = std::thread::spawn(move || task.poll());

            assert_eq!(handle.block_on().unwrap(), 5);
            let result = poller.join().unwrap();
            assert!(matches!(
                result,
                PollResult::Ready | PollResult::ReadyJoined
            ));
        });
    }

    #[test]
    fn detach_after_completion_discards_the_output() {
        struct Payload(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Payload {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = dropped.clone();
        let (task, handle) = make_task(async move { Payload(flag) });

        assert_eq!(task.poll(), PollResult::Ready);
        assert!(!dropped.load(Ordering::Acquire), "output is retained for the handle");

        // dropping the handle without awaiting must free the output
        drop(handle);
        assert!(dropped.load(Ordering::Acquire));

        drop(task);
    }

    #[test]
    fn join_errors_render_their_cause() {
        let cancelled = JoinError::cancelled(Id::next());
        assert!(cancelled.is_cancelled());
        assert!(format!("{cancelled}").contains("cancelled"));

        let panicked = JoinError::panicked(Id::next(), Box::new("boom"));
        assert!(panicked.is_panic());
        assert!(format!("{panicked}").contains("panicked"));
        assert_eq!(
            panicked.into_panic().downcast_ref::<&str>(),
            Some(&"boom")
        );
    }
}
