// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-local per-poll scratch: the current runtime and the cooperative
//! scheduling budget.
//!
//! Workers install the runtime pointer and a slice deadline around every
//! task poll; everything else reads them through the free functions below.
//! The only other piece of global mutable state is the process-wide default
//! runtime, installed by [`Builder::build`](crate::runtime::Builder::build)
//! and cleared again by
//! [`safe_shutdown`](crate::runtime::Runtime::safe_shutdown).

use crate::runtime::Inner;
use core::cell::{Cell, RefCell};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;

thread_local! {
    static CURRENT: RefCell<Option<Weak<Inner>>> = const { RefCell::new(None) };
    static COOP_DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
    static COOP_POLLS: Cell<u32> = const { Cell::new(0) };
}

static DEFAULT: Mutex<Option<Weak<Inner>>> = Mutex::new(None);

/// Installs `runtime` as this thread's current runtime for the lifetime of
/// the returned guard.
pub(crate) fn enter(runtime: Weak<Inner>) -> EnterGuard {
    let prev = CURRENT.with(|current| current.replace(Some(runtime)));
    EnterGuard { prev }
}

pub(crate) struct EnterGuard {
    prev: Option<Weak<Inner>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

/// The runtime current on this thread, falling back to the process-wide
/// default.
pub(crate) fn current_inner() -> Option<Arc<Inner>> {
    let local = CURRENT.with(|current| current.borrow().clone());
    if let Some(inner) = local.as_ref().and_then(Weak::upgrade) {
        return Some(inner);
    }
    DEFAULT.lock().as_ref().and_then(Weak::upgrade)
}

/// Installs `runtime` as the process-wide default, unless a live default
/// already exists.
pub(crate) fn set_default(runtime: &Arc<Inner>) {
    let mut default = DEFAULT.lock();
    if default.as_ref().and_then(Weak::upgrade).is_none() {
        *default = Some(Arc::downgrade(runtime));
    }
}

/// Clears the process-wide default if it refers to `runtime`.
pub(crate) fn clear_default(runtime: &Arc<Inner>) {
    let mut default = DEFAULT.lock();
    if let Some(current) = default.as_ref()
        && core::ptr::eq(current.as_ptr(), Arc::as_ptr(runtime))
    {
        *default = None;
    }
}

/// Resets this thread's cooperative budget: the next scheduling slice ends
/// at `deadline`.
pub(crate) fn set_coop_deadline(deadline: Instant) {
    COOP_DEADLINE.with(|cell| cell.set(Some(deadline)));
    COOP_POLLS.with(|cell| cell.set(0));
}

/// Returns `true` once the current task has exceeded its scheduling slice.
///
/// The check is designed to be cheap enough for hot loops: a counter is
/// bumped on every call and the monotonic clock is only sampled every 64th
/// call. Pollables that may run long are expected to consult this (e.g. via
/// [`coop_yield`](crate::task::coop_yield)) and voluntarily return
/// `Pending`; the scheduler cannot preempt them.
pub fn should_coop_yield() -> bool {
    let polls = COOP_POLLS.with(|cell| {
        let polls = cell.get().wrapping_add(1);
        cell.set(polls);
        polls
    });

    if polls % 64 == 0 {
        match COOP_DEADLINE.with(Cell::get) {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    } else {
        false
    }
}
