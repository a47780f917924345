// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::{Notified, Notify};
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll};

/// A level-triggered cancellation signal.
///
/// Once [`cancel`](Self::cancel)led, a token stays cancelled forever:
/// [`is_cancelled`](Self::is_cancelled) keeps returning `true` and every
/// [`cancelled`](Self::cancelled) future (past or future) completes.
#[derive(Debug, Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// A future completing when (or immediately, if) the token is
    /// cancelled.
    pub fn cancelled(&self) -> WaitCancelled<'_> {
        WaitCancelled {
            token: self,
            notified: None,
        }
    }
}

/// Future returned by [`CancellationToken::cancelled`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WaitCancelled<'a> {
    token: &'a CancellationToken,
    notified: Option<Notified<'a>>,
}

impl Future for WaitCancelled<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }

        if self.notified.is_none() {
            self.notified = Some(self.token.notify.notified());
        }

        let notified = self.notified.as_mut().expect("just installed");
        if Pin::new(notified).poll(cx).is_ready() {
            return Poll::Ready(());
        }

        // the registration above races the flag: cancel() may have run
        // between the flag check and registering, in which case the
        // notification was already consumed by notify_all
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }

        Poll::Pending
    }
}
