// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicU64, Ordering};
use core::task::Waker;
use std::time::Instant;

/// A sorted queue of timer entries, totally ordered by `(expiry, id)`.
///
/// The driver only stores and wakes wakers; it never touches a future. A
/// woken waker re-polls its sleep/timeout/interval, which re-checks
/// `now >= expiry` itself, so spurious wakes are tolerated by design.
#[derive(Debug)]
pub(crate) struct TimeDriver {
    entries: spin::Mutex<Vec<TimerEntry>>,
}

#[derive(Debug)]
struct TimerEntry {
    expiry: Instant,
    id: u64,
    waker: Waker,
}

impl TimerEntry {
    fn key(&self) -> (Instant, u64) {
        (self.expiry, self.id)
    }
}

/// Timer ids come from a process-wide monotonic counter and are never
/// reused within a run, so an `(expiry, id)` pair identifies an entry
/// exactly.
fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

impl TimeDriver {
    pub(crate) fn new() -> Self {
        Self {
            entries: spin::Mutex::new(Vec::new()),
        }
    }

    /// Inserts an entry waking `waker` at `expiry`; returns the entry's id
    /// for later removal.
    pub(crate) fn add_entry(&self, expiry: Instant, waker: Waker) -> u64 {
        let id = next_id();
        let entry = TimerEntry { expiry, id, waker };

        let mut entries = self.entries.lock();
        let at = entries
            .binary_search_by(|probe| probe.key().cmp(&entry.key()))
            .unwrap_err();
        entries.insert(at, entry);

        id
    }

    /// Removes the entry identified by `(expiry, id)`, if it is still
    /// queued.
    pub(crate) fn remove_entry(&self, expiry: Instant, id: u64) {
        let mut entries = self.entries.lock();
        if let Ok(at) = entries.binary_search_by(|probe| probe.key().cmp(&(expiry, id))) {
            entries.remove(at);
        }
    }

    /// Drains every entry whose expiry has passed and wakes it.
    pub(crate) fn do_work(&self) {
        let now = Instant::now();

        let expired: Vec<TimerEntry> = {
            let mut entries = self.entries.lock();
            let split = entries.partition_point(|entry| entry.expiry <= now);
            entries.drain(..split).collect()
        };

        // wake outside the lock; wakers may take arbitrary locks themselves
        for entry in expired {
            tracing::trace!(timer.id = entry.id, "timer expired");
            entry.waker.wake();
        }
    }

    /// Drops every queued entry (and with them the wakers they hold).
    /// Called on shutdown.
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    fn queued_ids(&self) -> Vec<u64> {
        self.entries.lock().iter().map(|e| e.id).collect()
    }
}
