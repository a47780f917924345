// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A condvar-backed parker used to block synchronous callers on async
//! completions (`block_on`, `acquire_blocking`).

use core::task::{RawWaker, RawWakerVTable, Waker};
use parking_lot::{Condvar, Mutex};
use static_assertions::assert_impl_all;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) struct Parker(Arc<Inner>);
assert_impl_all!(Parker: Send, Sync);

#[derive(Debug)]
struct Inner {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Inner {
            notified: Mutex::new(false),
            cv: Condvar::new(),
        }))
    }

    /// Blocks the calling thread until [`unpark`](Inner::unpark) is called.
    ///
    /// Consumes the notification, so the parker can be reused for the next
    /// poll round.
    pub(crate) fn park(&self) {
        let mut notified = self.0.notified.lock();
        while !*notified {
            self.0.cv.wait(&mut notified);
        }
        *notified = false;
    }

    /// Convert self into an async Rust compatible `Waker` which will unpark
    /// the owning thread.
    pub(crate) fn into_waker(self) -> Waker {
        // Safety: the vtable functions uphold the RawWaker contract, see below
        unsafe { Waker::from_raw(Self::into_raw_waker(self.0)) }
    }

    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::waker_clone,
        Self::waker_wake,
        Self::waker_wake_by_ref,
        Self::waker_drop,
    );

    unsafe fn waker_clone(raw: *const ()) -> RawWaker {
        // Safety: `raw` was produced by `Arc::into_raw` in `into_raw_waker`
        unsafe {
            Arc::increment_strong_count(raw.cast::<Inner>());
            Self::into_raw_waker(Arc::from_raw(raw.cast::<Inner>()))
        }
    }

    unsafe fn waker_wake(raw: *const ()) {
        // Safety: `raw` was produced by `Arc::into_raw` in `into_raw_waker`
        let inner = unsafe { Arc::from_raw(raw.cast::<Inner>()) };
        inner.unpark();
    }

    unsafe fn waker_wake_by_ref(raw: *const ()) {
        // Safety: `raw` was produced by `Arc::into_raw` in `into_raw_waker`
        unsafe { (*raw.cast::<Inner>()).unpark() }
    }

    unsafe fn waker_drop(raw: *const ()) {
        // Safety: `raw` was produced by `Arc::into_raw` in `into_raw_waker`
        unsafe { drop(Arc::from_raw(raw.cast::<Inner>())) }
    }

    // `Waker::will_wake` only checks for pointer equality, and an inlined
    // constructor would give the vtable a different address before and after
    // `.clone()`, causing spurious waker replacement everywhere. The
    // `inline(never)` below is therefore quite load-bearing.
    #[inline(never)]
    fn into_raw_waker(inner: Arc<Inner>) -> RawWaker {
        RawWaker::new(Arc::into_raw(inner).cast::<()>(), &Self::WAKER_VTABLE)
    }
}

impl Inner {
    fn unpark(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cv.notify_one();
    }
}
