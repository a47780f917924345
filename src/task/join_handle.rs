// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park::Parker;
use crate::task::{Id, PanicPayload, TaskRef, TaskStats};
use core::fmt;
use core::marker::PhantomData;
use core::pin::Pin;
use core::task::{Context, Poll};

/// An owned permission to join on a task (await its completion).
///
/// Dropping a `JoinHandle` *detaches* the task: it keeps running in the
/// background and its output is discarded once it completes. Awaiting the
/// handle resolves to the task's output, or to a [`JoinError`] if the task
/// was [aborted](Self::abort) or its future panicked.
///
/// Awaiting a `JoinHandle` never drives the task's future itself; it only
/// registers the caller's waker to be notified on completion.
#[must_use = "dropping a JoinHandle detaches the task"]
pub struct JoinHandle<T> {
    task: Option<TaskRef>,
    id: Id,
    _output: PhantomData<fn() -> T>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef) -> Self {
        let id = task.id();
        Self {
            task: Some(task),
            id,
            _output: PhantomData,
        }
    }

    /// Returns the task's unique identifier.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Aborts the task, ensuring its future will be dropped without running
    /// to completion.
    ///
    /// If the task is currently being polled it still runs until it yields.
    /// Awaiting the handle afterwards resolves to a cancellation
    /// [`JoinError`] once the future has actually been destroyed.
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.cancel();
        }
    }

    /// Detaches from the task, letting it run to completion in the
    /// background and discard its output.
    ///
    /// This is the same as dropping the handle, spelled out.
    pub fn detach(self) {}

    /// Blocks the calling thread until the task completes.
    ///
    /// Do not call this from async code; it parks the whole thread.
    pub fn block_on(mut self) -> Result<T, JoinError> {
        let parker = Parker::new();
        let waker = parker.clone().into_waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            if let Poll::Ready(out) = Pin::new(&mut self).poll(&mut cx) {
                return out;
            }
            parker.park();
        }
    }

    /// Returns `true` while the handle still refers to a live task, i.e. it
    /// has not yet resolved.
    pub fn is_valid(&self) -> bool {
        self.task.is_some()
    }

    /// Returns `true` once the task has run to completion.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(TaskRef::is_complete)
    }

    /// Sets a debug name for the task, visible in [`TaskStats`].
    pub fn set_name(&self, name: impl Into<String>) {
        if let Some(task) = &self.task {
            task.set_name(name);
        }
    }

    /// Returns a snapshot of the task's diagnostic counters, or `None` if
    /// the handle has already resolved.
    pub fn stats(&self) -> Option<TaskStats> {
        self.task.as_ref().map(TaskRef::stats)
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let task = this
            .task
            .as_ref()
            .expect("JoinHandle polled after completion");

        // Safety: the handle was created with this output type
        let poll = unsafe { task.poll_join::<T>(cx) };

        if poll.is_ready() {
            // consume the handle: release the HAS_HANDLE bit and our task
            // reference
            let task = this.task.take().expect("handle already consumed");
            task.drop_handle();
        }

        poll
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.drop_handle();
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

// Safety: the task's state protocol synchronizes all cross-thread access;
// the output only moves through `poll_join`, and spawning requires it to be
// `Send`
unsafe impl<T: Send> Send for JoinHandle<T> {}
// Safety: as above
unsafe impl<T: Send> Sync for JoinHandle<T> {}

/// Error returned by awaiting a [`JoinHandle`] whose task did not produce
/// an output.
pub struct JoinError {
    id: Id,
    repr: Repr,
}

enum Repr {
    /// The task was closed (aborted or detached) before completing.
    Cancelled,
    /// The task's future panicked.
    Panic(PanicPayload),
}

impl JoinError {
    pub(crate) fn cancelled(id: Id) -> Self {
        Self {
            id,
            repr: Repr::Cancelled,
        }
    }

    pub(crate) fn panicked(id: Id, payload: PanicPayload) -> Self {
        Self {
            id,
            repr: Repr::Panic(payload),
        }
    }

    /// Returns `true` if the task was cancelled before completion.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.repr, Repr::Cancelled)
    }

    /// Returns `true` if the task's future panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self.repr, Repr::Panic(_))
    }

    /// Consumes the error, returning the panic payload.
    ///
    /// # Panics
    ///
    /// Panics if the error is not a panic error. Check [`Self::is_panic`]
    /// first, or use [`Self::try_into_panic`].
    pub fn into_panic(self) -> PanicPayload {
        self.try_into_panic()
            .expect("`JoinError` is not a panic error")
    }

    /// Consumes the error, returning the panic payload if the task
    /// panicked, or the error back otherwise.
    pub fn try_into_panic(self) -> Result<PanicPayload, Self> {
        match self.repr {
            Repr::Panic(payload) => Ok(payload),
            Repr::Cancelled => Err(self),
        }
    }

    /// The id of the task this error came from.
    pub fn id(&self) -> Id {
        self.id
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Cancelled => write!(f, "task {} was cancelled", self.id),
            Repr::Panic(_) => write!(f, "task {} panicked", self.id),
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Cancelled => write!(f, "JoinError::Cancelled({})", self.id),
            Repr::Panic(_) => write!(f, "JoinError::Panic({})", self.id),
        }
    }
}

impl core::error::Error for JoinError {}
