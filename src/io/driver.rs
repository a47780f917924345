// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::io::Interest;
use crate::runtime;
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use core::task::{Context, Waker};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

/// At most this many fds are handed to `poll(2)` per driver tick; the rest
/// wait for the next tick.
const MAX_BATCH: usize = 64;

#[derive(Debug)]
pub(crate) struct IoDriver {
    entries: spin::Mutex<HashMap<RawFd, Arc<IoEntry>>>,
}

/// Shared per-fd state. All registrations for the same fd share one entry;
/// the entry is removed when the last registration is dropped.
#[derive(Debug)]
struct IoEntry {
    fd: RawFd,
    /// Cached readiness bits ([`Interest`] encoding).
    readiness: AtomicU8,
    waiters: spin::Mutex<Vec<IoWaiter>>,
    /// Hints for the driver tick: whether any parked waiter wants
    /// readable/writable events. Updated on registration and waiter
    /// removal.
    any_read: AtomicBool,
    any_write: AtomicBool,
    /// Number of live [`Registration`]s. Mutated under the driver map lock
    /// so a concurrent `register_io` cannot resurrect an entry that is
    /// being removed.
    registrations: AtomicUsize,
    runtime: Weak<runtime::Inner>,
}

#[derive(Debug)]
struct IoWaiter {
    /// Consumed on wake; refreshed by the next `poll_ready`.
    waker: Option<Waker>,
    id: u64,
    interest: Interest,
}

impl IoWaiter {
    fn satisfied_by(&self, ready: Interest) -> bool {
        self.interest.intersects(ready)
    }

    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

fn next_waiter_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

impl IoDriver {
    pub(crate) fn new() -> Self {
        Self {
            entries: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Returns a registration for `fd`, creating the shared entry if this
    /// is the first one.
    pub(crate) fn register_io(&self, fd: RawFd, runtime: Weak<runtime::Inner>) -> Registration {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(&fd) {
            tracing::trace!(fd, "returning already registered io entry");
            entry.registrations.fetch_add(1, Ordering::Relaxed);
            return Registration {
                entry: entry.clone(),
            };
        }

        let entry = Arc::new(IoEntry {
            fd,
            readiness: AtomicU8::new(0),
            waiters: spin::Mutex::new(Vec::new()),
            any_read: AtomicBool::new(false),
            any_write: AtomicBool::new(false),
            registrations: AtomicUsize::new(1),
            runtime,
        });
        entries.insert(fd, entry.clone());
        tracing::trace!(fd, "registered io entry");

        Registration { entry }
    }

    fn drop_registration(&self, entry: &Arc<IoEntry>) {
        let mut entries = self.entries.lock();
        let remaining = entry.registrations.fetch_sub(1, Ordering::Relaxed) - 1;
        tracing::trace!(fd = entry.fd, remaining, "dropped io registration");
        if remaining == 0 {
            entries.remove(&entry.fd);
        }
    }

    /// One driver tick: `poll(2)` every fd some waiter is hinting at, with
    /// zero timeout, and wake the waiters the reported events satisfy.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "the batch holds at most 64 fds"
    )]
    pub(crate) fn do_work(&self) {
        let mut batch: ArrayVec<Arc<IoEntry>, MAX_BATCH> = ArrayVec::new();
        let mut pollfds: ArrayVec<libc::pollfd, MAX_BATCH> = ArrayVec::new();

        {
            let entries = self.entries.lock();
            for (fd, entry) in entries.iter() {
                let read = entry.any_read.load(Ordering::Relaxed);
                let write = entry.any_write.load(Ordering::Relaxed);
                if !read && !write {
                    continue;
                }
                if batch.is_full() {
                    break;
                }

                let mut events: libc::c_short = 0;
                if read {
                    events |= libc::POLLIN;
                }
                if write {
                    events |= libc::POLLOUT;
                }
                pollfds.push(libc::pollfd {
                    fd: *fd,
                    events,
                    revents: 0,
                });
                batch.push(entry.clone());
            }
        }

        if pollfds.is_empty() {
            return;
        }

        // Safety: `pollfds` points to `len` initialized pollfd structs and
        // a zero timeout never blocks
        let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, 0) };

        if ret == 0 {
            return;
        }
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return;
            }
            tracing::warn!("io driver poll failed: {err}");
            return;
        }

        tracing::trace!(fds = ret, "io driver poll returned events");

        for (entry, pollfd) in batch.iter().zip(&pollfds) {
            if pollfd.revents == 0 {
                continue;
            }

            let mut ready = Interest::empty();
            if pollfd.revents & libc::POLLIN != 0 {
                ready |= Interest::READABLE;
            }
            if pollfd.revents & libc::POLLOUT != 0 {
                ready |= Interest::WRITABLE;
            }
            if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                ready |= Interest::ERROR;
            }

            entry.readiness.fetch_or(ready.bits(), Ordering::AcqRel);

            let mut waiters = entry.waiters.lock();
            for waiter in waiters.iter_mut() {
                if waiter.satisfied_by(ready) {
                    tracing::trace!(fd = entry.fd, waiter = waiter.id, "waking io waiter");
                    waiter.wake();
                }
            }
        }
    }

    /// Drops every entry's parked wakers and the driver's entry map.
    /// Called on shutdown; live registrations keep their entries alive but
    /// will never be woken again.
    pub(crate) fn clear(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.values() {
            entry.waiters.lock().clear();
        }
        entries.clear();
    }
}

/// A refcounted handle onto the shared readiness state of one fd.
///
/// All operations act on the shared entry alone, so a registration remains
/// safe to use after its runtime has been dropped; waits simply stay
/// pending forever because no driver tick will ever report the fd again.
#[derive(Debug)]
pub struct Registration {
    entry: Arc<IoEntry>,
}

impl Registration {
    pub fn fd(&self) -> RawFd {
        self.entry.fd
    }

    /// Polls the fd for the given interest.
    ///
    /// Returns the satisfied readiness bits if any are cached (fast path),
    /// or [`Interest::empty`] after parking (or refreshing) a waiter for
    /// `cx.waker()`. `id` is the caller's waiter id slot: zero means "not
    /// registered"; the id written on first registration must be passed
    /// back on subsequent calls and to [`Self::unregister_waiter`].
    pub fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>, id: &mut u64) -> Interest {
        // error events always terminate a wait
        let interest = interest | Interest::ERROR;
        let entry = &*self.entry;

        let current = Interest::from_bits_truncate(entry.readiness.load(Ordering::Acquire));
        let ready = current & interest;
        if !ready.is_empty() {
            return ready;
        }

        let mut waiters = entry.waiters.lock();

        // re-check now that we hold the waiter lock; the driver may have
        // published readiness between our load and the lock (the classic
        // lost-wakeup window)
        let current = Interest::from_bits_truncate(entry.readiness.load(Ordering::Acquire));
        let ready = current & interest;
        if !ready.is_empty() {
            return ready;
        }

        if *id != 0 {
            // already registered; just make sure our waker is current
            let waiter = waiters
                .iter_mut()
                .find(|waiter| waiter.id == *id)
                .expect("poll_ready called with a stale waiter id");
            let stale = waiter
                .waker
                .as_ref()
                .is_none_or(|waker| !waker.will_wake(cx.waker()));
            if stale {
                waiter.waker = Some(cx.waker().clone());
            }
            return Interest::empty();
        }

        *id = next_waiter_id();
        waiters.push(IoWaiter {
            waker: Some(cx.waker().clone()),
            id: *id,
            interest,
        });
        drop(waiters);

        tracing::trace!(fd = entry.fd, ?interest, "added io waiter");

        if interest.contains(Interest::READABLE) {
            entry.any_read.store(true, Ordering::Release);
        }
        if interest.contains(Interest::WRITABLE) {
            entry.any_write.store(true, Ordering::Release);
        }

        Interest::empty()
    }

    /// Clears cached readiness bits. Called when the consumer observed
    /// `EWOULDBLOCK` on the real syscall: the cache said ready, the kernel
    /// disagreed, so the next wait goes through the driver again.
    pub fn clear_readiness(&self, interest: Interest) {
        self.entry
            .readiness
            .fetch_and(!interest.bits(), Ordering::AcqRel);
    }

    /// Removes the waiter registered under `id` and recomputes the entry's
    /// readable/writable hints.
    pub fn unregister_waiter(&self, id: u64) {
        if id == 0 {
            return;
        }

        let entry = &*self.entry;
        let mut waiters = entry.waiters.lock();

        let Some(at) = waiters.iter().position(|waiter| waiter.id == id) else {
            return;
        };
        waiters.remove(at);

        let mut has_read = false;
        let mut has_write = false;
        for waiter in waiters.iter() {
            has_read |= waiter.interest.contains(Interest::READABLE);
            has_write |= waiter.interest.contains(Interest::WRITABLE);
            if has_read && has_write {
                break;
            }
        }

        entry.any_read.store(has_read, Ordering::Release);
        entry.any_write.store(has_write, Ordering::Release);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.entry.runtime.upgrade()
            && !inner.is_shutting_down()
            && let Some(driver) = inner.io_driver()
        {
            driver.drop_registration(&self.entry);
        } else {
            // the driver (and its map) is gone; just release our count
            self.entry.registrations.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Reads and clears the fd's pending socket error (`SO_ERROR`).
///
/// Callers use this to turn an [`Interest::ERROR`] readiness report into a
/// concrete [`io::Error`]; a cleared-but-persistent error condition simply
/// re-reports on the next wait until the real read/write stops failing.
#[expect(
    clippy::cast_possible_truncation,
    reason = "sizeof(c_int) fits any socklen_t"
)]
pub fn error_from_socket(fd: RawFd) -> io::Error {
    let mut err: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;

    // Safety: fd is a caller-supplied descriptor and the out-pointers are
    // valid for a c_int
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            core::ptr::from_mut(&mut err).cast(),
            &mut len,
        )
    };

    if ret != 0 {
        return io::Error::last_os_error();
    }
    io::Error::from_raw_os_error(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::task::Poll;
    use futures::task::noop_waker;

    struct Pipe {
        read: RawFd,
        write: RawFd,
    }

    impl Pipe {
        fn new() -> Self {
            let mut fds = [0 as libc::c_int; 2];
            // Safety: fds is a valid out-array of two c_ints
            let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
            assert_eq!(ret, 0, "pipe(2) failed");
            Self {
                read: fds[0],
                write: fds[1],
            }
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            // Safety: we own both fds
            unsafe {
                libc::close(self.read);
                libc::close(self.write);
            }
        }
    }

    fn noop_cx_poll<R>(f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        f(&mut cx)
    }

    #[test]
    fn writable_pipe_reports_ready_after_a_tick() {
        let driver = IoDriver::new();
        let pipe = Pipe::new();
        let reg = driver.register_io(pipe.write, Weak::new());

        // nothing cached yet: first poll parks a waiter
        let mut id = 0;
        let ready = noop_cx_poll(|cx| reg.poll_ready(Interest::WRITABLE, cx, &mut id));
        assert!(ready.is_empty());
        assert_ne!(id, 0);

        // an empty pipe is writable, so a tick publishes readiness
        driver.do_work();
        let ready = noop_cx_poll(|cx| reg.poll_ready(Interest::WRITABLE, cx, &mut id));
        assert!(ready.contains(Interest::WRITABLE));

        reg.unregister_waiter(id);
    }

    #[test]
    fn read_readiness_arrives_with_data() {
        let driver = IoDriver::new();
        let pipe = Pipe::new();
        let reg = driver.register_io(pipe.read, Weak::new());

        let mut id = 0;
        let ready = noop_cx_poll(|cx| reg.poll_ready(Interest::READABLE, cx, &mut id));
        assert!(ready.is_empty());

        // nothing to read yet
        driver.do_work();
        let ready = noop_cx_poll(|cx| reg.poll_ready(Interest::READABLE, cx, &mut id));
        assert!(ready.is_empty());

        // Safety: writing one byte into our own pipe
        let wrote = unsafe { libc::write(pipe.write, [7u8].as_ptr().cast(), 1) };
        assert_eq!(wrote, 1);

        driver.do_work();
        let ready = noop_cx_poll(|cx| reg.poll_ready(Interest::READABLE, cx, &mut id));
        assert!(ready.contains(Interest::READABLE));

        reg.unregister_waiter(id);
    }

    #[test]
    fn waiters_are_woken_by_matching_events_only() {
        use core::sync::atomic::AtomicUsize;

        struct CountingWake(AtomicUsize);
        impl std::task::Wake for CountingWake {
            fn wake(self: Arc<Self>) {
                self.0.fetch_add(1, Ordering::Release);
            }
        }

        let driver = IoDriver::new();
        let pipe = Pipe::new();
        let write_reg = driver.register_io(pipe.write, Weak::new());

        let wakes = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = Waker::from(wakes.clone());
        let mut cx = Context::from_waker(&waker);

        let mut id = 0;
        assert!(
            write_reg
                .poll_ready(Interest::WRITABLE, &mut cx, &mut id)
                .is_empty()
        );

        driver.do_work();
        assert_eq!(wakes.0.load(Ordering::Acquire), 1, "writable fd wakes once");

        // the waker was consumed by the wake; polling again refreshes it
        assert!(
            !write_reg
                .poll_ready(Interest::WRITABLE, &mut cx, &mut id)
                .is_empty(),
            "readiness is cached after the tick"
        );
    }

    #[test]
    fn clear_readiness_reparks_the_waiter() {
        let driver = IoDriver::new();
        let pipe = Pipe::new();
        let reg = driver.register_io(pipe.write, Weak::new());

        let mut id = 0;
        let _ = noop_cx_poll(|cx| reg.poll_ready(Interest::WRITABLE, cx, &mut id));
        driver.do_work();
        assert!(!noop_cx_poll(|cx| reg.poll_ready(Interest::WRITABLE, cx, &mut id)).is_empty());

        // pretend the write hit EWOULDBLOCK
        reg.clear_readiness(Interest::WRITABLE);
        let mut id2 = 0;
        let ready = noop_cx_poll(|cx| reg.poll_ready(Interest::WRITABLE, cx, &mut id2));
        assert!(ready.is_empty(), "cleared readiness must re-park");

        reg.unregister_waiter(id);
        reg.unregister_waiter(id2);
    }

    #[test]
    fn closed_peer_collapses_to_the_error_bit() {
        let mut fds = [0 as libc::c_int; 2];
        // Safety: fds is a valid out-array of two c_ints
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        let (read, write) = (fds[0], fds[1]);

        let driver = IoDriver::new();
        let reg = driver.register_io(read, Weak::new());

        let mut id = 0;
        assert!(noop_cx_poll(|cx| reg.poll_ready(Interest::READABLE, cx, &mut id)).is_empty());

        // Safety: closing our own write end hangs up the pipe
        unsafe { libc::close(write) };
        driver.do_work();

        let ready = noop_cx_poll(|cx| reg.poll_ready(Interest::READABLE, cx, &mut id));
        assert!(
            ready.contains(Interest::ERROR),
            "POLLHUP must collapse into the ERROR bit, got {ready:?}"
        );

        reg.unregister_waiter(id);
        drop(reg);
        // Safety: we own the read end
        unsafe { libc::close(read) };
    }

    #[test]
    fn registrations_share_one_entry_per_fd() {
        let driver = IoDriver::new();
        let pipe = Pipe::new();

        let a = driver.register_io(pipe.read, Weak::new());
        let b = driver.register_io(pipe.read, Weak::new());
        assert!(Arc::ptr_eq(&a.entry, &b.entry));

        drop(a);
        assert_eq!(driver.entries.lock().len(), 1, "entry stays while b lives");
        drop(b);
        // without a live runtime the map is not cleaned up by the drop
        // path, but the refcount must have reached zero
    }

    #[test]
    fn registration_outlives_its_runtime() {
        // a registration whose runtime is long gone must stay inert, not
        // crash (sending on such an fd just never completes)
        let driver = IoDriver::new();
        let pipe = Pipe::new();
        let reg = driver.register_io(pipe.read, Weak::new());
        drop(driver);

        let mut id = 0;
        let ready = noop_cx_poll(|cx| reg.poll_ready(Interest::READABLE, cx, &mut id));
        assert!(ready.is_empty());
        reg.unregister_waiter(id);
        drop(reg);
    }

    #[test]
    fn runtime_driver_ticks_wake_io_waiters() {
        let rt = crate::Runtime::new(1);
        let pipe = Pipe::new();
        let reg = rt.register_io(pipe.read).unwrap();
        let write_fd = pipe.write;

        let writer = std::thread::spawn(move || {
            std::thread::sleep(core::time::Duration::from_millis(20));
            // Safety: writing one byte into our own pipe
            unsafe { libc::write(write_fd, [1u8].as_ptr().cast(), 1) };
        });

        rt.block_on(async move {
            let mut id = 0;
            crate::future::poll_fn(|cx| {
                if reg.poll_ready(Interest::READABLE, cx, &mut id).is_empty() {
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            })
            .await;
            reg.unregister_waiter(id);
        });

        writer.join().unwrap();
    }

    #[test]
    fn socket_error_of_a_healthy_pipe_is_clean() {
        let mut fds = [0 as libc::c_int; 2];
        // Safety: fds is a valid out-array of two c_ints
        let ret =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);

        let err = error_from_socket(fds[0]);
        assert_eq!(err.raw_os_error(), Some(0), "no pending socket error");

        // Safety: we own both fds
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
