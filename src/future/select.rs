// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Waiting on multiple branches at once, committing to whichever becomes
//! ready first.

use core::pin::Pin;
use core::task::{Context, Poll};
use pin_project::pin_project;

/// Creates a select branch from a future and a callback.
///
/// The callback runs at most once, with the branch's output, and returns a
/// future that the surrounding [`select`] polls to completion (wrap a plain
/// value in [`ready`](crate::future::ready) for a synchronous callback).
/// All callbacks of one `select` must agree on their output type.
pub fn branch<F, C, R>(future: F, callback: C) -> Branch<F, C, R>
where
    F: Future,
    C: FnOnce(F::Output) -> R,
    R: Future,
{
    Branch {
        future: Some(future),
        callback: Some(callback),
        output: None,
        cb_future: None,
        enabled: true,
    }
}

/// One branch of a [`select`], created by [`branch`].
#[pin_project]
#[must_use = "select branches do nothing unless passed to `select`"]
pub struct Branch<F: Future, C, R> {
    #[pin]
    future: Option<F>,
    callback: Option<C>,
    output: Option<F::Output>,
    #[pin]
    cb_future: Option<R>,
    enabled: bool,
}

impl<F, C, R> Branch<F, C, R>
where
    F: Future,
    C: FnOnce(F::Output) -> R,
    R: Future,
{
    /// Enables or disables this branch; a disabled branch is never polled
    /// and can never win.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Polls the branch future; returns `true` if it just became the
    /// winner (its output is parked in the branch and the future dropped).
    fn poll_future(self: Pin<&mut Self>, cx: &mut Context<'_>) -> bool {
        let mut this = self.project();
        if !*this.enabled {
            return false;
        }
        let Some(future) = this.future.as_mut().as_pin_mut() else {
            return false;
        };

        match future.poll(cx) {
            Poll::Ready(output) => {
                *this.output = Some(output);
                this.future.set(None);
                true
            }
            Poll::Pending => false,
        }
    }

    /// Drops the branch future in place. Losing branches are never polled
    /// again.
    fn drop_future(self: Pin<&mut Self>) {
        self.project().future.set(None);
    }

    /// Invokes the callback (once) with the parked output and drives the
    /// future it returned.
    fn poll_callback(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R::Output> {
        let mut this = self.project();

        if this.cb_future.as_mut().as_pin_mut().is_none() {
            let callback = this
                .callback
                .take()
                .expect("select polled after completion");
            let output = this.output.take().expect("winner has no output");
            this.cb_future.set(Some(callback(output)));
        }

        this.cb_future
            .as_pin_mut()
            .expect("callback future was just installed")
            .poll(cx)
    }
}

/// Polls every enabled branch in declaration order until one is ready (the
/// "winner"; ties break towards the earlier branch), then drops all losing
/// branches and drives the winner's callback to completion.
///
/// Losers are dropped as soon as the winner is decided and are never
/// re-polled, even if the winner's callback suspends. A `select` whose
/// branches are all disabled stays pending forever.
pub fn select<B: SelectSet>(branches: B) -> Select<B> {
    Select {
        branches,
        winner: None,
    }
}

/// Future returned by [`select`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Select<B> {
    branches: B,
    winner: Option<u32>,
}

impl<B: SelectSet> Future for Select<B> {
    type Output = B::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: `branches` is structurally pinned; `winner` is plain data
        let this = unsafe { self.get_unchecked_mut() };
        // Safety: as above
        let branches = unsafe { Pin::new_unchecked(&mut this.branches) };
        branches.poll_select(&mut this.winner, cx)
    }
}

/// A tuple of [`Branch`]es that can be polled by [`select`]. Implemented
/// for tuples of up to eight branches.
pub trait SelectSet {
    type Output;

    #[doc(hidden)]
    fn poll_select(
        self: Pin<&mut Self>,
        winner: &mut Option<u32>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output>;
}

macro_rules! impl_select {
    ($(($idx:tt, $F:ident, $C:ident, $R:ident)),+) => {
        impl<Out, $($F, $C, $R),+> SelectSet for ($(Branch<$F, $C, $R>,)+)
        where
            $($F: Future, $C: FnOnce($F::Output) -> $R, $R: Future<Output = Out>,)+
        {
            type Output = Out;

            fn poll_select(
                self: Pin<&mut Self>,
                winner: &mut Option<u32>,
                cx: &mut Context<'_>,
            ) -> Poll<Out> {
                // Safety: tuple fields are structurally pinned and never
                // moved out
                let this = unsafe { self.get_unchecked_mut() };

                if winner.is_none() {
                    $(
                        if winner.is_none() {
                            // Safety: as above
                            let branch = unsafe { Pin::new_unchecked(&mut this.$idx) };
                            if branch.poll_future(cx) {
                                *winner = Some($idx);
                            }
                        }
                    )+

                    if let Some(won) = *winner {
                        // the winner is decided: drop every loser's future
                        // right away, they are never polled again
                        $(
                            if won != $idx {
                                // Safety: as above
                                unsafe { Pin::new_unchecked(&mut this.$idx) }.drop_future();
                            }
                        )+
                    }
                }

                match *winner {
                    None => Poll::Pending,
                    $(
                        // Safety: as above
                        Some($idx) => unsafe { Pin::new_unchecked(&mut this.$idx) }.poll_callback(cx),
                    )+
                    Some(_) => unreachable!("select winner out of range"),
                }
            }
        }
    };
}

impl_select!((0, F0, C0, R0));
impl_select!((0, F0, C0, R0), (1, F1, C1, R1));
impl_select!((0, F0, C0, R0), (1, F1, C1, R1), (2, F2, C2, R2));
impl_select!((0, F0, C0, R0), (1, F1, C1, R1), (2, F2, C2, R2), (3, F3, C3, R3));
impl_select!(
    (0, F0, C0, R0),
    (1, F1, C1, R1),
    (2, F2, C2, R2),
    (3, F3, C3, R3),
    (4, F4, C4, R4)
);
impl_select!(
    (0, F0, C0, R0),
    (1, F1, C1, R1),
    (2, F2, C2, R2),
    (3, F3, C3, R3),
    (4, F4, C4, R4),
    (5, F5, C5, R5)
);
impl_select!(
    (0, F0, C0, R0),
    (1, F1, C1, R1),
    (2, F2, C2, R2),
    (3, F3, C3, R3),
    (4, F4, C4, R4),
    (5, F5, C5, R5),
    (6, F6, C6, R6)
);
impl_select!(
    (0, F0, C0, R0),
    (1, F1, C1, R1),
    (2, F2, C2, R2),
    (3, F3, C3, R3),
    (4, F4, C4, R4),
    (5, F5, C5, R5),
    (6, F6, C6, R6),
    (7, F7, C7, R7)
);
