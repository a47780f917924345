// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O readiness driver.
//!
//! File descriptors are registered once per fd (a [`Registration`] is a
//! refcounted handle onto the shared per-fd entry); interested futures call
//! [`Registration::poll_ready`] which either observes cached readiness or
//! parks a waker, and the workers' driver ticks batch all hinted fds into a
//! single zero-timeout `poll(2)` call and wake whoever the reported events
//! satisfy.
//!
//! The readiness byte is level-cached: once an fd was reported readable it
//! stays "readable" until the consumer actually hits `EWOULDBLOCK` and
//! calls [`Registration::clear_readiness`].

mod driver;

use crate::NoRuntime;
use crate::runtime::{self, context};
use bitflags::bitflags;
use std::os::fd::RawFd;
use std::sync::Arc;

pub(crate) use driver::IoDriver;
pub use driver::{Registration, error_from_socket};

bitflags! {
    /// The readiness events a waiter is interested in, and the events an fd
    /// currently has raised.
    ///
    /// `ERROR` is implicitly added to every wait: `POLLERR`, `POLLHUP` and
    /// `POLLNVAL` all collapse into it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const ERROR = 0b100;
    }
}

/// Registers `fd` with the current runtime's I/O driver.
///
/// # Errors
///
/// Returns [`NoRuntime`] when no runtime is installed on this thread, or
/// the runtime was built without an I/O driver.
pub fn register(fd: RawFd) -> Result<Registration, NoRuntime> {
    let inner = context::current_inner().ok_or(NoRuntime(()))?;
    register_on(&inner, fd)
}

pub(crate) fn register_on(
    inner: &Arc<runtime::Inner>,
    fd: RawFd,
) -> Result<Registration, NoRuntime> {
    let driver = inner.io_driver().ok_or(NoRuntime(()))?;
    Ok(driver.register_io(fd, Arc::downgrade(inner)))
}
