// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::semaphore::{Acquire, Semaphore};
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::pin::Pin;
use core::task::{Context, Poll};

/// An async mutex: a [`Semaphore`] with one permit guarding a value.
///
/// The guard is held across `.await` points; waiters queue FIFO on the
/// underlying semaphore.
///
/// ```
/// use std::sync::Arc;
///
/// let rt = spindle::Runtime::new(2);
/// let counter = Arc::new(spindle::sync::Mutex::new(0));
///
/// rt.block_on({
///     let counter = counter.clone();
///     async move {
///         *counter.lock().await += 1;
///     }
/// });
///
/// assert_eq!(*counter.blocking_lock(), 1);
/// ```
pub struct Mutex<T> {
    semaphore: Semaphore,
    value: UnsafeCell<T>,
}

// Safety: the semaphore hands out at most one guard at a time, which is the
// only path to the value
unsafe impl<T: Send> Send for Mutex<T> {}
// Safety: as above
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            semaphore: Semaphore::new(1),
            value: UnsafeCell::new(value),
        }
    }

    /// Locks the mutex, waiting until it is available.
    pub fn lock(&self) -> Lock<'_, T> {
        Lock {
            mutex: self,
            acquire: self.semaphore.acquire(1),
        }
    }

    /// Attempts to lock the mutex without waiting.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.semaphore.try_acquire(1) {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Locks the mutex, blocking the calling thread. Do not call this from
    /// async code.
    pub fn blocking_lock(&self) -> MutexGuard<'_, T> {
        self.semaphore.acquire_blocking(1);
        MutexGuard { mutex: self }
    }

    /// Consumes the mutex, returning the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Mutable access without locking; the borrow checker guarantees
    /// exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => s.field("value", &*guard),
            None => s.field("value", &"<locked>"),
        }
        .finish()
    }
}

/// Future returned by [`Mutex::lock`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Lock<'a, T> {
    mutex: &'a Mutex<T>,
    acquire: Acquire<'a>,
}

impl<'a, T> Future for Lock<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.acquire).poll(cx) {
            Poll::Ready(()) => Poll::Ready(MutexGuard { mutex: this.mutex }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Scoped access to the value guarded by a [`Mutex`]; unlocks on drop.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: holding the guard means holding the semaphore's only
        // permit
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.semaphore.release(1);
    }
}

impl<T: fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
