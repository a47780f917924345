// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime: a fixed pool of worker threads sharing one FIFO run queue,
//! interleaving task execution with staggered driver ticks.

pub(crate) mod context;

use crate::blocking::{BlockingHandle, BlockingPool};
#[cfg(unix)]
use crate::io::IoDriver;
use crate::task::{Id, JoinHandle, PollResult, TaskBuilder, TaskRef, TaskStats};
use crate::time::TimeDriver;
#[cfg(unix)]
use crate::NoRuntime;
use crate::SpawnError;
use core::mem;
use core::panic::AssertUnwindSafe;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

pub use context::should_coop_yield;

/// Handler invoked when a panic escapes the scheduler machinery itself (as
/// opposed to a task's future, whose panics are delivered through its
/// [`JoinHandle`]).
pub type TerminateHandler = Box<dyn Fn(crate::task::PanicPayload) + Send + Sync>;

const MAX_WORKERS: usize = 128;

/// Configures and builds a [`Runtime`].
#[derive(Debug, Clone)]
pub struct Builder {
    workers: usize,
    time_driver: bool,
    io_driver: bool,
    signal_driver: bool,
    completion_driver: bool,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(4, usize::from),
            time_driver: true,
            io_driver: true,
            signal_driver: false,
            completion_driver: false,
        }
    }

    /// The number of worker threads, clamped to `1..=128`.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Enables or disables the time driver (`sleep`, `timeout`,
    /// `interval`). Defaults to enabled.
    pub fn time_driver(mut self, enabled: bool) -> Self {
        self.time_driver = enabled;
        self
    }

    /// Enables or disables the I/O readiness driver. Defaults to enabled.
    /// Has no effect on non-Unix targets.
    pub fn io_driver(mut self, enabled: bool) -> Self {
        self.io_driver = enabled;
        self
    }

    /// Accepted for interface parity; signal delivery is out of scope on
    /// this target and enabling it only logs a warning.
    pub fn signal_driver(mut self, enabled: bool) -> Self {
        self.signal_driver = enabled;
        self
    }

    /// Accepted for interface parity; the completion (IOCP) driver only
    /// exists on Windows and enabling it here only logs a warning.
    pub fn completion_driver(mut self, enabled: bool) -> Self {
        self.completion_driver = enabled;
        self
    }

    pub fn build(self) -> Runtime {
        let workers = self.workers.clamp(1, MAX_WORKERS);

        if self.signal_driver {
            tracing::warn!("signal driver is not supported on this target, ignoring");
        }
        if self.completion_driver {
            tracing::warn!("completion driver is not supported on this target, ignoring");
        }
        #[cfg(not(unix))]
        if self.io_driver {
            tracing::warn!("io driver is not supported on this target, ignoring");
        }

        let inner = Arc::new(Inner {
            stop: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            tasks: Mutex::new(HashMap::new()),
            time_driver: self.time_driver.then(TimeDriver::new),
            #[cfg(unix)]
            io_driver: self.io_driver.then(IoDriver::new),
            blocking: Arc::new(BlockingPool::new()),
            // the per-task scheduling slice grows slightly sublinearly with
            // the worker count; ~5ms on a single worker
            coop_slice: Duration::from_micros(scaled_micros(5_000.0, workers)),
            workers,
            worker_handles: Mutex::new(Vec::new()),
            terminate_handler: Mutex::new(None),
        });

        context::set_default(&inner);

        let handles = (0..workers)
            .map(|id| {
                let rt = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("spindle-worker-{id}"))
                    .spawn(move || worker_entry(&rt, id))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        *inner.worker_handles.lock() = handles;

        tracing::debug!(workers, "runtime started");

        Runtime { inner }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned async runtime.
///
/// The `Runtime` is the sole owner of its worker pool and drivers; dropping
/// it performs a [`safe_shutdown`](Self::safe_shutdown). Lightweight access
/// from tasks and other threads goes through [`Handle`].
#[derive(Debug)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Creates a runtime with `workers` worker threads and all supported
    /// drivers enabled.
    pub fn new(workers: usize) -> Self {
        Builder::new().workers(workers).build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// A cheap clonable handle to this runtime.
    pub fn handle(&self) -> Handle {
        Handle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Spawns `future` as a new task, returning a [`JoinHandle`] for its
    /// output.
    ///
    /// # Panics
    ///
    /// Panics if the runtime is shutting down; use [`Self::try_spawn`] to
    /// handle that case.
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.try_spawn(future).expect("failed to spawn task")
    }

    /// Attempts to spawn `future` as a new task.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Shutdown`] if the runtime is shutting down.
    #[track_caller]
    pub fn try_spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.spawn_inner(TaskBuilder::new(), future)
    }

    /// Runs `f` on the blocking pool, returning a future for its result.
    ///
    /// ```
    /// let rt = spindle::Runtime::new(1);
    /// let sum = rt.block_on(async {
    ///     spindle::Handle::current()
    ///         .unwrap()
    ///         .spawn_blocking(|| (1..=10).sum::<u32>())
    ///         .await
    /// });
    /// assert_eq!(sum, 55);
    /// ```
    pub fn spawn_blocking<T, F>(&self, f: F) -> BlockingHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.blocking.spawn_blocking(f)
    }

    /// Spawns `future` as a task and blocks the calling thread until it
    /// completes, without occupying a worker.
    ///
    /// # Panics
    ///
    /// Resumes the task's panic if its future panicked, and panics if the
    /// task was aborted out from under the caller.
    #[track_caller]
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let _ctx = context::enter(Arc::downgrade(&self.inner));
        match self.spawn(future).block_on() {
            Ok(output) => output,
            Err(err) => match err.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(err) => panic!("block_on task failed: {err}"),
            },
        }
    }

    /// Registers `fd` with the I/O readiness driver.
    ///
    /// # Errors
    ///
    /// Returns [`NoRuntime`] if the runtime was built without an I/O driver.
    #[cfg(unix)]
    pub fn register_io(
        &self,
        fd: std::os::fd::RawFd,
    ) -> Result<crate::io::Registration, NoRuntime> {
        crate::io::register_on(&self.inner, fd)
    }

    /// Installs a handler for panics escaping the scheduler machinery.
    pub fn set_terminate_handler(
        &self,
        handler: impl Fn(crate::task::PanicPayload) + Send + Sync + 'static,
    ) {
        *self.inner.terminate_handler.lock() = Some(Box::new(handler));
    }

    /// Diagnostic snapshots of every live task.
    pub fn task_stats(&self) -> Vec<TaskStats> {
        self.inner
            .tasks
            .lock()
            .values()
            .map(TaskRef::stats)
            .collect()
    }

    /// Shuts the runtime down: stops and joins all workers, releases the
    /// drivers, then aborts every still-live task and polls it once so its
    /// future can run cleanup.
    ///
    /// Idempotent; also invoked by `Drop`.
    pub fn safe_shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// A cheap, clonable reference to a [`Runtime`].
///
/// Handles hold only a weak reference: they never keep a dropped runtime
/// alive, and operations on a dead runtime fail with [`SpawnError`].
#[derive(Debug, Clone)]
pub struct Handle {
    inner: Weak<Inner>,
}

impl Handle {
    /// The runtime current on this thread (installed by workers around each
    /// poll and by `block_on`), falling back to the process-wide default.
    pub fn current() -> Option<Handle> {
        context::current_inner().map(|inner| Handle {
            inner: Arc::downgrade(&inner),
        })
    }

    /// Spawns `future` as a new task.
    ///
    /// # Panics
    ///
    /// Panics if the runtime is gone or shutting down; use
    /// [`Self::try_spawn`] to handle those cases.
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.try_spawn(future).expect("failed to spawn task")
    }

    /// Attempts to spawn `future` as a new task.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the runtime is gone or shutting down.
    #[track_caller]
    pub fn try_spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_with(TaskBuilder::new(), future)
    }

    /// Runs `f` on the blocking pool, returning a future for its result.
    ///
    /// # Panics
    ///
    /// Panics if the runtime is gone.
    pub fn spawn_blocking<T, F>(&self, f: F) -> BlockingHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.upgrade().expect("runtime has been dropped");
        inner.blocking.spawn_blocking(f)
    }

    #[track_caller]
    pub(crate) fn spawn_with<F>(
        &self,
        builder: TaskBuilder<'_>,
        future: F,
    ) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = self.inner.upgrade().ok_or(SpawnError::NoRuntime)?;
        inner.spawn_inner(builder, future)
    }
}

// === impl Inner ===

pub(crate) struct Inner {
    stop: AtomicBool,
    queue: Mutex<VecDeque<TaskRef>>,
    queue_cv: Condvar,
    /// Every live task, for diagnostics and shutdown. The worker that
    /// finishes a task removes it.
    tasks: Mutex<HashMap<Id, TaskRef>>,
    time_driver: Option<TimeDriver>,
    #[cfg(unix)]
    io_driver: Option<IoDriver>,
    blocking: Arc<BlockingPool>,
    coop_slice: Duration,
    workers: usize,
    worker_handles: Mutex<Vec<thread::JoinHandle<()>>>,
    terminate_handler: Mutex<Option<TerminateHandler>>,
}

impl Inner {
    /// Enqueues a task onto the run queue. No-op (dropping the scheduling
    /// reference) while shutting down.
    pub(crate) fn enqueue(&self, task: TaskRef) {
        if self.stop.load(Ordering::Acquire) {
            drop(task);
            return;
        }
        self.queue.lock().push_back(task);
        self.queue_cv.notify_one();
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn time_driver(&self) -> Option<&TimeDriver> {
        self.time_driver.as_ref()
    }

    #[cfg(unix)]
    pub(crate) fn io_driver(&self) -> Option<&IoDriver> {
        self.io_driver.as_ref()
    }

    #[track_caller]
    pub(crate) fn spawn_inner<F>(
        self: &Arc<Self>,
        builder: TaskBuilder<'_>,
        future: F,
    ) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(SpawnError::Shutdown);
        }

        let (task, join) = builder.bind(Arc::downgrade(self), future);
        self.tasks.lock().insert(task.id(), task.clone());
        self.enqueue(task);
        Ok(join)
    }

    fn shutdown(self: &Arc<Self>) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!("runtime shutting down");
        context::clear_default(self);

        self.queue_cv.notify_all();
        self.blocking.shutdown();

        let handles: Vec<_> = mem::take(&mut *self.worker_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }

        // drop the scheduling references still sitting in the queue
        self.queue.lock().clear();

        // release the wakers the drivers are holding
        if let Some(td) = &self.time_driver {
            td.clear();
        }
        #[cfg(unix)]
        if let Some(io) = &self.io_driver {
            io.clear();
        }

        // abort every still-live task, polling it once so its future gets
        // dropped and can run cleanup; handles outside observe cancellation
        let tasks: Vec<TaskRef> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in tasks {
            task.cancel();
            if !task.is_complete() {
                let _ = task.poll();
            }
        }
    }
}

impl core::fmt::Debug for Inner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("runtime::Inner")
            .field("workers", &self.workers)
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === worker loop ===

fn worker_entry(inner: &Arc<Inner>, id: usize) {
    let _ctx = context::enter(Arc::downgrade(inner));

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| worker_main(inner, id)));
    if let Err(payload) = result {
        tracing::error!(worker = id, "worker terminating due to uncaught panic");
        let handler = inner.terminate_handler.lock();
        if let Some(handler) = handler.as_ref() {
            handler(payload);
        } else {
            drop(handler);
            std::panic::resume_unwind(payload);
        }
    }
}

fn worker_main(inner: &Arc<Inner>, id: usize) {
    let _span = tracing::debug_span!("worker main loop", worker = id).entered();

    let workers = u64::try_from(inner.workers).expect("worker count fits in u64");
    let id = u64::try_from(id).expect("worker id fits in u64");

    // each worker ticks the drivers on its own cadence, offset by its index
    // so the drivers are polled evenly rather than by all workers at once
    let timer_inc = scaled_micros(500.0, inner.workers);
    let io_inc = scaled_micros(800.0, inner.workers);
    let timer_off = Duration::from_micros(timer_inc * id / workers);
    let io_off = Duration::from_micros(io_inc * id / workers);

    let start = Instant::now();
    let mut timer_tick: u64 = 0;
    let mut io_tick: u64 = 0;
    let mut next_timer = start + timer_off;
    let mut next_io = start + io_off;

    'run: loop {
        let now = Instant::now();
        let mut deadline = now + Duration::from_secs(3600);

        if let Some(td) = &inner.time_driver {
            if now >= next_timer {
                td.do_work();
                while now >= next_timer {
                    timer_tick += 1;
                    next_timer = start + timer_off + Duration::from_micros(timer_inc * timer_tick);
                }
            }
            deadline = deadline.min(next_timer);
        }

        #[cfg(unix)]
        if let Some(io) = &inner.io_driver {
            if now >= next_io {
                io.do_work();
                while now >= next_io {
                    io_tick += 1;
                    next_io = start + io_off + Duration::from_micros(io_inc * io_tick);
                }
            }
            deadline = deadline.min(next_io);
        }
        #[cfg(not(unix))]
        {
            let _ = (&mut next_io, &mut io_tick, io_off, io_inc);
        }

        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if inner.stop.load(Ordering::Acquire) {
                    break 'run;
                }
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if inner.queue_cv.wait_until(&mut queue, deadline).timed_out() {
                    break None;
                }
            }
        };

        // a timeout just means it's time to tick the drivers again
        let Some(task) = task else { continue };

        tracing::trace!(worker = id, task = ?task, "driving task");
        context::set_coop_deadline(Instant::now() + inner.coop_slice);

        match task.poll() {
            PollResult::PendingSchedule => inner.enqueue(task),
            PollResult::Ready | PollResult::ReadyJoined => {
                inner.tasks.lock().remove(&task.id());
            }
            PollResult::Pending => {}
        }
    }

    tracing::debug!(worker = id, "stop signal received, shutting down");
}

/// `base · workersᵒ·⁹` in whole microseconds.
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    reason = "worker counts are at most 128 and the products stay tiny"
)]
fn scaled_micros(base: f64, workers: usize) -> u64 {
    (base * (workers as f64).powf(0.9)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default()
    }

    #[test]
    fn block_on_basic_spawn() {
        let _trace = trace();

        let rt = Runtime::new(1);
        let out = rt.block_on(async {
            let handle = Handle::current().unwrap().spawn(async { 42 });
            handle.await.unwrap()
        });
        assert_eq!(out, 42);
    }

    #[test]
    fn spawn_many() {
        let _trace = trace();

        static POLLS: AtomicUsize = AtomicUsize::new(0);
        const TASKS: usize = 100;

        let rt = Runtime::new(4);
        rt.block_on(async {
            let handles: Vec<_> = (0..TASKS)
                .map(|i| {
                    Handle::current().unwrap().spawn(async move {
                        POLLS.fetch_add(1, Ordering::Relaxed);
                        crate::task::yield_now().await;
                        i
                    })
                })
                .collect();

            let mut sum = 0;
            for handle in handles {
                sum += handle.await.unwrap();
            }
            assert_eq!(sum, (0..TASKS).sum());
        });
        assert_eq!(POLLS.load(Ordering::Relaxed), TASKS);
    }

    #[test]
    fn abort_resolves_handle_and_drops_future() {
        let _trace = trace();

        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());

        let rt = Runtime::new(1);
        let handle = rt.spawn(async move {
            let _guard = guard;
            crate::future::never::<()>().await;
        });

        handle.abort();
        let err = handle.block_on().unwrap_err();
        assert!(err.is_cancelled());
        assert!(dropped.load(Ordering::Acquire));
    }

    #[test]
    fn task_panic_is_delivered_to_the_handle() {
        let _trace = trace();

        let rt = Runtime::new(1);
        let handle = rt.spawn(async {
            panic!("kaboom");
        });

        let err = handle.block_on().unwrap_err();
        assert!(err.is_panic());
        let payload = err.into_panic();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"kaboom"));
    }

    #[test]
    fn detached_task_still_completes() {
        let _trace = trace();

        static DONE: AtomicBool = AtomicBool::new(false);

        let rt = Runtime::new(1);
        rt.spawn(async {
            crate::task::yield_now().await;
            DONE.store(true, Ordering::Release);
        })
        .detach();

        rt.block_on(async {
            while !DONE.load(Ordering::Acquire) {
                crate::task::yield_now().await;
            }
        });
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_spawns() {
        let _trace = trace();

        let rt = Runtime::new(2);
        rt.safe_shutdown();
        rt.safe_shutdown();

        assert!(matches!(
            rt.try_spawn(async {}),
            Err(SpawnError::Shutdown)
        ));
    }

    #[test]
    fn shutdown_aborts_live_tasks() {
        let _trace = trace();

        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());

        let rt = Runtime::new(1);
        let handle = rt.spawn(async move {
            let _guard = guard;
            crate::future::never::<()>().await;
        });

        // give the worker a chance to park the task
        std::thread::sleep(Duration::from_millis(20));

        rt.safe_shutdown();
        assert!(dropped.load(Ordering::Acquire), "shutdown must drop the future");

        let err = handle.block_on().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn cross_thread_wakeups_reach_the_task() {
        let _trace = trace();

        let rt = Runtime::new(2);
        let (tx, rx) = crate::sync::oneshot::channel();

        let handle = rt.spawn(async move { rx.await.unwrap() });

        // wake the parked task from a plain OS thread
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            tx.send(99u32).unwrap();
        });

        assert_eq!(handle.block_on().unwrap(), 99);
        sender.join().unwrap();
    }

    #[test]
    fn many_sleepers_all_wake() {
        let _trace = trace();

        const TASKS: u64 = 50;

        let rt = Runtime::new(4);
        let begin = Instant::now();

        rt.block_on(async {
            let handles: Vec<_> = (0..TASKS)
                .map(|i| {
                    Handle::current().unwrap().spawn(async move {
                        crate::time::sleep(Duration::from_millis(i % 25 + 1)).await;
                        i
                    })
                })
                .collect();

            let mut sum = 0;
            for handle in handles {
                sum += handle.await.unwrap();
            }
            assert_eq!(sum, (0..TASKS).sum());
        });

        let elapsed = begin.elapsed();
        assert!(
            elapsed >= Duration::from_millis(25),
            "the longest sleeper bounds the batch, got {elapsed:?}"
        );
    }

    #[test]
    fn completed_tasks_are_never_polled_again() {
        let _trace = trace();

        static POLLS: AtomicUsize = AtomicUsize::new(0);

        let rt = Runtime::new(2);
        let handle = rt.spawn(async {
            POLLS.fetch_add(1, Ordering::Relaxed);
            crate::task::yield_now().await;
            POLLS.fetch_add(1, Ordering::Relaxed);
        });

        handle.block_on().unwrap();
        assert_eq!(POLLS.load(Ordering::Relaxed), 2);

        // churn the scheduler; the completed task's future is gone and must
        // never run again
        rt.block_on(async {
            for _ in 0..16 {
                crate::task::yield_now().await;
            }
        });
        assert_eq!(POLLS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn task_stats_carry_names() {
        let _trace = trace();

        let rt = Runtime::new(1);
        let handle = rt.spawn(async {
            crate::future::never::<()>().await;
        });
        handle.set_name("sleeper");

        let stats = rt.task_stats();
        assert!(
            stats
                .iter()
                .any(|s| s.name.as_deref() == Some("sleeper")),
            "expected a live task named sleeper, got {stats:?}"
        );

        handle.abort();
    }

    #[test]
    fn combinators_compose_on_the_runtime() {
        let _trace = trace();

        let rt = Runtime::new(2);
        let out = rt.block_on(async {
            let first = crate::future::select((
                crate::future::branch(crate::time::sleep(Duration::from_millis(5)), |()| {
                    crate::future::ready("slept")
                }),
                crate::future::branch(crate::future::never::<()>(), |()| {
                    crate::future::ready("never")
                }),
            ))
            .await;

            let timed = crate::time::timeout(Duration::from_secs(5), async {
                crate::task::yield_now().await;
                7
            })
            .await;

            let joined = crate::future::join_all((0..5).map(|i| {
                let handle = Handle::current().unwrap().spawn(async move { i * 2 });
                async move { handle.await.unwrap() }
            }))
            .await;

            (first, timed, joined)
        });

        assert_eq!(out.0, "slept");
        assert_eq!(out.1, Ok(7));
        assert_eq!(out.2, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn poll_counters_accumulate() {
        let _trace = trace();

        let rt = Runtime::new(1);
        let token = Arc::new(crate::sync::CancellationToken::new());
        let (tx, rx) = crate::sync::oneshot::channel();

        let handle = rt.spawn({
            let token = token.clone();
            async move {
                crate::task::yield_now().await;
                crate::task::yield_now().await;
                let _ = tx.send(());
                token.cancelled().await;
            }
        });

        // once the oneshot resolves, the task has been polled at least three
        // times (two yields plus the poll that sent)
        futures::executor::block_on(rx).unwrap();
        let stats = handle.stats().expect("task is still live");
        assert!(stats.polls >= 3, "got {} polls", stats.polls);

        token.cancel();
        handle.block_on().unwrap();
    }

    #[test]
    fn current_handle_falls_back_to_the_default_runtime() {
        let _trace = trace();

        let rt = Runtime::new(1);
        // this thread never entered the runtime, so this exercises the
        // process-global default
        let handle = Handle::current().expect("default runtime should be installed");
        let out = handle.spawn(async { 7 }).block_on().unwrap();
        assert_eq!(out, 7);
        drop(rt);
    }
}
