// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::mem;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Polls every future in `iter` to completion, yielding all outputs in
/// input order.
///
/// Each poll of the combinator polls every child that has not completed
/// yet; completed children park their output until the whole set is done.
/// `join_all` of an empty iterator is immediately ready with an empty vec.
pub fn join_all<I>(iter: I) -> JoinAll<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    JoinAll {
        elems: iter.into_iter().map(MaybeDone::Pending).collect::<Box<[_]>>().into(),
    }
}

/// Future returned by [`join_all`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct JoinAll<F: Future> {
    elems: Pin<Box<[MaybeDone<F>]>>,
}

impl<F: Future> core::fmt::Debug for JoinAll<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JoinAll")
            .field("len", &self.elems.len())
            .finish_non_exhaustive()
    }
}

enum MaybeDone<F: Future> {
    Pending(F),
    Done(F::Output),
    Taken,
}

impl<F: Future> MaybeDone<F> {
    /// Polls the wrapped future if it is still pending; returns whether it
    /// is done afterwards.
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> bool {
        // Safety: the future is pinned transitively through `self` and is
        // never moved out of its slot, only dropped in place by `set` below
        let poll = match unsafe { self.as_mut().get_unchecked_mut() } {
            // Safety: as above
            MaybeDone::Pending(future) => unsafe { Pin::new_unchecked(future) }.poll(cx),
            _ => return true,
        };

        match poll {
            Poll::Ready(output) => {
                self.set(MaybeDone::Done(output));
                true
            }
            Poll::Pending => false,
        }
    }

    fn take(self: Pin<&mut Self>) -> F::Output {
        // Safety: `Done` and `Taken` hold no pinned data
        let this = unsafe { self.get_unchecked_mut() };
        match mem::replace(this, MaybeDone::Taken) {
            MaybeDone::Done(output) => output,
            _ => unreachable!("JoinAll output taken twice"),
        }
    }
}

fn iter_pin_mut<T>(slice: Pin<&mut [T]>) -> impl Iterator<Item = Pin<&mut T>> {
    // Safety: the individual elements of a pinned slice are themselves
    // pinned and never move relative to each other
    unsafe { slice.get_unchecked_mut() }
        .iter_mut()
        // Safety: as above
        .map(|elem| unsafe { Pin::new_unchecked(elem) })
}

impl<F: Future> Future for JoinAll<F> {
    type Output = Vec<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut all_done = true;
        for elem in iter_pin_mut(self.elems.as_mut()) {
            if !elem.poll(cx) {
                all_done = false;
            }
        }

        if !all_done {
            return Poll::Pending;
        }

        let outputs = iter_pin_mut(self.elems.as_mut())
            .map(MaybeDone::take)
            .collect();
        Poll::Ready(outputs)
    }
}
