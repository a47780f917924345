// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::runtime::{self, Handle};
use crate::task::{Id, JoinHandle, TaskRef};
use crate::SpawnError;
use core::panic::Location;
use std::sync::Weak;

/// Configures a task before spawning it: debug name and spawn location.
///
/// ```no_run
/// # let rt = spindle::Runtime::new(1);
/// # rt.block_on(async {
/// let handle = spindle::task::TaskBuilder::new()
///     .name("metrics-flusher")
///     .spawn(&spindle::Handle::current().unwrap(), async { /* .. */ })
///     .unwrap();
/// # });
/// ```
#[derive(Debug, Default)]
pub struct TaskBuilder<'a> {
    name: Option<&'a str>,
    location: Option<&'static Location<'static>>,
}

impl<'a> TaskBuilder<'a> {
    pub fn new() -> Self {
        Self {
            name: None,
            location: None,
        }
    }

    /// Override the name of the task spawned by this builder.
    ///
    /// By default, tasks are unnamed.
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the source code location that will be associated with the
    /// task.
    ///
    /// By default, tasks inherit the source code location of where they were
    /// spawned.
    pub fn location(mut self, location: &'static Location<'static>) -> Self {
        self.location = Some(location);
        self
    }

    /// Spawn `future` onto the runtime behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] when the runtime is gone or shutting down.
    #[track_caller]
    pub fn spawn<F>(self, handle: &Handle, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        handle.spawn_with(self, future)
    }

    /// Allocates the task bound to `runtime` without enqueueing it.
    #[track_caller]
    pub(crate) fn bind<F>(
        self,
        runtime: Weak<runtime::Inner>,
        future: F,
    ) -> (TaskRef, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = Id::next();

        let loc = self.location.unwrap_or(Location::caller());
        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.name = ?self.name,
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        TaskRef::new_allocated(future, id, runtime, self.name.map(str::to_owned), span)
    }
}
