// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A dynamically sized thread pool for offloading synchronous work.
//!
//! Workers are spawned on demand when every live worker is busy, and idle
//! workers terminate themselves after 30 seconds as long as more than the
//! minimum remain. The pool never blocks async workers: the handle returned
//! by [`spawn_blocking`](crate::runtime::Runtime::spawn_blocking) is an
//! ordinary future.

use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::task::{Context, Poll, Waker};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const MIN_WORKERS: usize = 2;
const MAX_WORKERS: usize = 128;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct BlockingPool {
    queue: Mutex<VecDeque<Arc<dyn Run>>>,
    condvar: Condvar,
    stop: AtomicBool,
    /// Workers currently alive / currently executing a closure.
    alive: AtomicUsize,
    busy: AtomicUsize,
    next_worker_id: AtomicUsize,
}

/// Type-erased blocking work unit.
trait Run: Send + Sync {
    fn run(&self);
}

struct BlockingTask<T> {
    cell: spin::Mutex<TaskCell<T>>,
}

struct TaskCell<T> {
    func: Option<Box<dyn FnOnce() -> T + Send>>,
    result: Option<thread::Result<T>>,
    /// The awaiting task's waker; refreshed by every pending poll of the
    /// handle.
    waker: Option<Waker>,
}

impl<T: Send> Run for BlockingTask<T> {
    fn run(&self) {
        let func = self
            .cell
            .lock()
            .func
            .take()
            .expect("blocking task executed twice");

        let result = std::panic::catch_unwind(AssertUnwindSafe(func));

        let waker = {
            let mut cell = self.cell.lock();
            cell.result = Some(result);
            cell.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Future resolving to the result of a closure running on the blocking
/// pool.
///
/// If the closure panicked, awaiting the handle resumes the panic in the
/// awaiting task.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct BlockingHandle<T> {
    task: Arc<BlockingTask<T>>,
}

impl<T> Unpin for BlockingHandle<T> {}

impl<T: Send> Future for BlockingHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.task.cell.lock();

        if let Some(result) = cell.result.take() {
            drop(cell);
            match result {
                Ok(value) => Poll::Ready(value),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        } else {
            let stale = cell
                .waker
                .as_ref()
                .is_none_or(|waker| !waker.will_wake(cx.waker()));
            if stale {
                cell.waker = Some(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}

impl<T> core::fmt::Debug for BlockingHandle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockingHandle").finish_non_exhaustive()
    }
}

impl BlockingPool {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop: AtomicBool::new(false),
            alive: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    pub(crate) fn spawn_blocking<T, F>(self: &Arc<Self>, func: F) -> BlockingHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let task = Arc::new(BlockingTask {
            cell: spin::Mutex::new(TaskCell {
                func: Some(Box::new(func)),
                result: None,
                waker: None,
            }),
        });

        {
            let mut queue = self.queue.lock();
            queue.push_back(task.clone());
            self.ensure_worker(queue.len());
        }
        self.condvar.notify_one();

        BlockingHandle { task }
    }

    /// Spawns a new worker if there is queued work and no free worker to
    /// pick it up.
    fn ensure_worker(self: &Arc<Self>, queued: usize) {
        let alive = self.alive.load(Ordering::Relaxed);
        if alive >= MAX_WORKERS {
            return;
        }
        if queued > 0 && self.busy.load(Ordering::Relaxed) >= alive {
            self.spawn_worker();
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let alive = self.alive.fetch_add(1, Ordering::Relaxed) + 1;
        if alive > MAX_WORKERS {
            self.alive.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("spindle-blocking-{id}"))
            .spawn(move || pool.worker_loop(id))
            .is_ok();
        if !spawned {
            tracing::warn!("failed to spawn blocking pool worker");
            self.alive.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn worker_loop(&self, id: usize) {
        let _span = tracing::debug_span!("blocking worker", worker = id).entered();
        let mut terminate_at = Instant::now() + IDLE_TIMEOUT;

        loop {
            // terminate if there has been no work in a while and enough
            // workers remain
            if Instant::now() >= terminate_at {
                let mut alive = self.alive.load(Ordering::Acquire);
                let mut terminated = false;
                while alive > MIN_WORKERS {
                    match self.alive.compare_exchange_weak(
                        alive,
                        alive - 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            terminated = true;
                            break;
                        }
                        Err(actual) => alive = actual,
                    }
                }
                if terminated {
                    tracing::debug!(worker = id, "blocking worker exiting due to inactivity");
                    return;
                }
                terminate_at = Instant::now() + IDLE_TIMEOUT;
            }

            let task = {
                let mut queue = self.queue.lock();
                loop {
                    if self.stop.load(Ordering::Acquire) {
                        self.alive.fetch_sub(1, Ordering::Release);
                        tracing::debug!(worker = id, "blocking worker stopping");
                        return;
                    }
                    if let Some(task) = queue.pop_front() {
                        break Some(task);
                    }
                    if self
                        .condvar
                        .wait_until(&mut queue, terminate_at)
                        .timed_out()
                    {
                        break None;
                    }
                }
            };

            let Some(task) = task else { continue };

            self.busy.fetch_add(1, Ordering::Relaxed);
            task.run();
            self.busy.fetch_sub(1, Ordering::Relaxed);

            terminate_at = Instant::now() + IDLE_TIMEOUT;
        }
    }

    /// Stops all workers and discards queued work. Handles of discarded
    /// tasks stay pending forever.
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.queue.lock().clear();
        self.condvar.notify_all();
    }
}

impl core::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockingPool")
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
