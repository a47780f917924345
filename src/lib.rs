// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multi-threaded async task runtime.
//!
//! `spindle` drives ordinary Rust [`Future`]s on a fixed pool of worker
//! threads that share a single FIFO run queue. Workers interleave task
//! execution with staggered ticks of the [time driver](crate::time) and the
//! [I/O readiness driver](crate::io), so no dedicated reactor thread exists.
//! Synchronous work is offloaded to a separately scaled
//! [blocking pool](crate::runtime::Runtime::spawn_blocking), and a small set
//! of [synchronization primitives](crate::sync) is built on top of the same
//! waker protocol the scheduler uses.
//!
//! ```no_run
//! let rt = spindle::Runtime::new(2);
//! let out = rt.block_on(async {
//!     let handle = spindle::Handle::current().unwrap().spawn(async { 21 * 2 });
//!     handle.await.unwrap()
//! });
//! assert_eq!(out, 42);
//! ```

mod error;
pub(crate) mod loom;
mod park;

pub mod blocking;
pub mod future;
#[cfg(unix)]
pub mod io;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use error::{Closed, NoRuntime, SpawnError};
pub use runtime::{Builder, Handle, Runtime};
pub use task::{JoinError, JoinHandle};
