// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::sleep::TimerRegistration;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::time::Instant;

/// Creates an [`Interval`] producing a tick every `period`, the first one
/// immediately.
///
/// # Panics
///
/// Panics if `period` is zero.
pub fn interval(period: Duration) -> Interval {
    assert!(period > Duration::ZERO, "interval period must be non-zero");
    Interval {
        next: Instant::now(),
        period,
        missed: MissedTickBehavior::Burst,
        id: 0,
        registration: TimerRegistration::new(),
    }
}

/// What an [`Interval`] does when the consumer falls more than one period
/// behind.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MissedTickBehavior {
    /// Catch up on missed ticks: they fire back-to-back until the interval
    /// has caught up with the wall clock. For example, with a 1 s period
    /// and 1.5 s of work between ticks, the next tick fires immediately and
    /// the one after 0.5 s later.
    #[default]
    Burst,
    /// Skip missed ticks: the next tick is rounded forward past `now` in
    /// whole periods, and an interval never fires twice without an actual
    /// wait in between.
    Skip,
}

/// A restartable tick source created by [`interval`].
///
/// Unlike [`sleep`](crate::time::sleep), an interval is re-armed by simply
/// calling [`tick`](Self::tick) again.
#[derive(Debug)]
pub struct Interval {
    /// The instant the pending tick fires at.
    next: Instant,
    period: Duration,
    missed: MissedTickBehavior,
    /// Timer entry id for the pending tick; 0 while unregistered.
    id: u64,
    registration: TimerRegistration,
}

impl Interval {
    /// Completes when the next tick is due.
    ///
    /// Dropping the returned future is harmless; the next call picks the
    /// same tick back up.
    pub fn tick(&mut self) -> Tick<'_> {
        Tick { interval: self }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn missed_tick_behavior(&self) -> MissedTickBehavior {
        self.missed
    }

    pub fn set_missed_tick_behavior(&mut self, behavior: MissedTickBehavior) {
        self.missed = behavior;
    }

    fn poll_tick(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let now = Instant::now();

        if now < self.next {
            if self.id == 0 {
                self.id = self.registration.register(self.next, cx.waker());
            }
            return Poll::Pending;
        }

        // tick! the timer entry (if any) either fired or will be drained as
        // expired; a fresh one is registered for the next pending tick
        self.id = 0;
        self.next += self.period;

        if self.missed == MissedTickBehavior::Skip {
            // round forward past now; skip never bursts
            while self.next <= now {
                self.next += self.period;
            }
        }

        Poll::Ready(())
    }
}

impl Drop for Interval {
    fn drop(&mut self) {
        self.registration.deregister(self.next, self.id);
    }
}

/// Future returned by [`Interval::tick`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Tick<'a> {
    interval: &'a mut Interval,
}

impl Future for Tick<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.interval.poll_tick(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn ticks_are_spaced_by_the_period() {
        let rt = Runtime::new(1);

        let begin = Instant::now();
        rt.block_on(async {
            let mut interval = interval(Duration::from_millis(10));
            // the first tick is immediate
            interval.tick().await;
            interval.tick().await;
            interval.tick().await;
        });

        let elapsed = begin.elapsed();
        assert!(
            elapsed >= Duration::from_millis(20),
            "three ticks span at least two periods, got {elapsed:?}"
        );
    }

    #[test]
    fn burst_catches_up_after_a_stall() {
        let rt = Runtime::new(1);

        rt.block_on(async {
            let mut interval = interval(Duration::from_millis(5));
            interval.tick().await;

            // fall three periods behind
            std::thread::sleep(Duration::from_millis(16));

            let begin = Instant::now();
            interval.tick().await;
            interval.tick().await;
            interval.tick().await;
            assert!(
                begin.elapsed() < Duration::from_millis(5),
                "burst mode must deliver missed ticks immediately"
            );
        });
    }

    #[test]
    fn skip_never_bursts() {
        let rt = Runtime::new(1);

        rt.block_on(async {
            let mut interval = interval(Duration::from_millis(5));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            // fall several periods behind
            std::thread::sleep(Duration::from_millis(18));

            // exactly one immediate catch-up tick...
            let begin = Instant::now();
            interval.tick().await;
            assert!(begin.elapsed() < Duration::from_millis(5));

            // ...then the next one requires an actual wait
            let begin = Instant::now();
            interval.tick().await;
            assert!(
                begin.elapsed() >= Duration::from_millis(1),
                "skip mode must not fire twice without waiting"
            );
        });
    }
}
