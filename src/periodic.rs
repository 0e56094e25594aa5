//! Periodic re-scheduling timer.
//!
//! A [`PeriodicTimer`] owns no thread of its own. It registers a wrapper
//! closure with a [`OneShot`] provider and the wrapper re-registers itself
//! every time the user work finishes, so exactly one one-shot registration
//! is outstanding at any instant and no two runs of the same timer ever
//! overlap.
//!
//! When a run overruns its period, the missed boundaries are skipped rather
//! than bursted: the next firing lands on the next boundary of the period
//! grid anchored at the timer's creation, so at most one firing happens per
//! wall-clock period regardless of how long a run took.
//!
//! ```text
//! <--period-->            | boundary skipped while   | work starts
//!                         | work is still running    v again
//! *-----------*-----------*-----------*-----------*-----------*---...
//! ............--------------->........------->....------->....
//! ^ scheduled ^ work starts           ^ work starts again
//! ```

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::oneshot::{OneShot, TaskHandle};
use crate::trace::{debug, trace};

/// Backoff between cancellation retries while a run is in flight.
const CANCEL_RETRY_BACKOFF: Duration = Duration::from_micros(50);

/// Error constructing a periodic timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PeriodicError {
    /// The period must be strictly positive.
    #[error("period must be non-zero")]
    ZeroPeriod,
}

/// A timer that runs a work closure once per period until cancelled.
///
/// Created by [`PeriodicTimer::schedule`], stopped by
/// [`PeriodicTimer::cancel`]. Dropping the timer without cancelling detaches
/// it: the work keeps firing for the scheduler's lifetime.
pub struct PeriodicTimer<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    scheduler: S,
    period: Duration,
    work: Box<dyn Fn() + Send + Sync>,
    /// Origin of the period grid used by the overrun skip policy.
    epoch: Instant,
    /// Handle of the one outstanding registration. The mutex provides the
    /// visibility barrier between the re-arming writer and a cancelling
    /// reader; it does not serialize any other logic.
    slot: Mutex<Option<TaskHandle>>,
}

impl<S: OneShot + Send + Sync + 'static> PeriodicTimer<S> {
    /// Schedules `work` to run every `period`, first firing one period from
    /// now.
    ///
    /// The work runs to completion on whichever thread the scheduler
    /// dispatches it to; consecutive firings may land on different threads
    /// but never overlap.
    ///
    /// # Errors
    ///
    /// Returns [`PeriodicError::ZeroPeriod`] for a zero period; nothing is
    /// registered with the scheduler in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    /// use std::time::Duration;
    ///
    /// use rearm::{PeriodicTimer, PoolConfig, WorkerPool};
    ///
    /// let pool = WorkerPool::spawn(PoolConfig::default());
    /// let fired = Arc::new(AtomicUsize::new(0));
    /// let counter = Arc::clone(&fired);
    /// let timer = PeriodicTimer::schedule(pool.scheduler(), Duration::from_millis(10), move || {
    ///     counter.fetch_add(1, Ordering::SeqCst);
    /// })
    /// .unwrap();
    ///
    /// std::thread::sleep(Duration::from_millis(50));
    /// timer.cancel();
    /// assert!(fired.load(Ordering::SeqCst) >= 1);
    /// pool.shutdown();
    /// ```
    pub fn schedule(
        scheduler: S,
        period: Duration,
        work: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, PeriodicError> {
        if period.is_zero() {
            return Err(PeriodicError::ZeroPeriod);
        }

        let now = Instant::now();
        let inner = Arc::new(Inner {
            scheduler,
            period,
            work: Box::new(work),
            epoch: now,
            slot: Mutex::new(None),
        });

        // Hold the slot across the first registration so a firing that wins
        // the race to a worker thread blocks until the handle is published.
        let mut slot = inner.slot.lock().unwrap();
        let fire_inner = Arc::clone(&inner);
        *slot = Some(
            inner
                .scheduler
                .schedule(now + period, Box::new(move || fire(&fire_inner))),
        );
        drop(slot);

        debug!(period_us = period.as_micros() as u64, "periodic timer armed");
        Ok(Self { inner })
    }

    /// Cancels the timer, blocking until no work closure is executing and
    /// none ever will be again.
    ///
    /// The retry loop resolves a benign race, not an error: cancellation of
    /// the current registration fails exactly when its run already started,
    /// and that run will re-arm on completion, at which point the next retry
    /// catches the fresh registration before it starts.
    ///
    /// Cancelling consumes the timer, so cancelling twice is a compile
    /// error.
    pub fn cancel(self) {
        let mut retries = 0u32;
        loop {
            {
                let mut slot = self.inner.slot.lock().unwrap();
                if let Some(handle) = slot.take() {
                    if self.inner.scheduler.cancel_scheduled(&handle) {
                        // The registration never started; the chain is
                        // severed and nothing is running.
                        drop(slot);
                        self.inner.scheduler.release_handle(handle);
                        debug!(retries, "periodic timer cancelled");
                        return;
                    }
                    *slot = Some(handle);
                } else {
                    return;
                }
            }
            retries += 1;
            thread::sleep(CANCEL_RETRY_BACKOFF);
        }
    }
}

/// The wrapper registered with the scheduler; the user work is never
/// registered directly.
///
/// Runs the work synchronously, computes the next due time and swaps the
/// just-completed handle for a fresh registration in one critical section on
/// the slot, so a concurrent canceller observes either the old handle or the
/// new one, never neither.
fn fire<S: OneShot + Send + Sync + 'static>(inner: &Arc<Inner<S>>) {
    let start = Instant::now();
    (inner.work)();
    let end = Instant::now();

    let elapsed = end.duration_since(start);
    let delay = next_delay(inner.period, elapsed, start.duration_since(inner.epoch));
    trace!(
        elapsed_us = elapsed.as_micros() as u64,
        delay_us = delay.as_micros() as u64,
        "re-arming"
    );

    let mut slot = inner.slot.lock().unwrap();
    if let Some(done) = slot.take() {
        inner.scheduler.release_handle(done);
    }
    let next = Arc::clone(inner);
    *slot = Some(
        inner
            .scheduler
            .schedule(end + delay, Box::new(move || fire(&next))),
    );
}

/// Next-fire delay, measured from the end of the run that just completed.
///
/// A run that fits within its period keeps the one-per-period cadence by
/// deducting the time it consumed. An overrunning run re-aligns to the next
/// boundary of the epoch-anchored period grid, skipping every boundary it
/// consumed; missed firings are never bursted back-to-back.
fn next_delay(period: Duration, elapsed: Duration, start_offset: Duration) -> Duration {
    if elapsed <= period {
        period - elapsed
    } else {
        let period_ns = period.as_nanos();
        let into_grid = start_offset.as_nanos() % period_ns;
        Duration::from_nanos((period_ns - into_grid) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::oneshot::WorkItem;

    /// Hand-driven scheduler: registrations fire only when the test pumps
    /// them, and every handle movement is recorded so tests can assert
    /// release hygiene.
    #[derive(Clone, Default)]
    struct ManualScheduler {
        state: Arc<Mutex<ManualState>>,
    }

    #[derive(Default)]
    struct ManualState {
        next_id: u64,
        pending: Vec<(u64, Instant, WorkItem)>,
        issued: Vec<u64>,
        released: Vec<u64>,
    }

    impl OneShot for ManualScheduler {
        fn schedule(&self, due: Instant, work: WorkItem) -> TaskHandle {
            let mut s = self.state.lock().unwrap();
            s.next_id += 1;
            let id = s.next_id;
            s.issued.push(id);
            s.pending.push((id, due, work));
            TaskHandle::new(std::num::NonZeroU64::new(id).unwrap())
        }

        fn cancel_scheduled(&self, handle: &TaskHandle) -> bool {
            let mut s = self.state.lock().unwrap();
            let id = handle.id().get();
            if let Some(pos) = s.pending.iter().position(|(pid, ..)| *pid == id) {
                s.pending.remove(pos);
                true
            } else {
                false
            }
        }

        fn release_handle(&self, handle: TaskHandle) {
            self.state.lock().unwrap().released.push(handle.id().get());
        }
    }

    impl ManualScheduler {
        /// Runs the earliest pending registration on the calling thread.
        fn fire_next(&self) {
            let work = {
                let mut s = self.state.lock().unwrap();
                let pos = s
                    .pending
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, (_, due, _))| *due)
                    .map(|(pos, _)| pos);
                let Some(pos) = pos else { return };
                let (_, _, work) = s.pending.remove(pos);
                work
            };
            work();
        }

        fn pending_len(&self) -> usize {
            self.state.lock().unwrap().pending.len()
        }

        fn issued(&self) -> Vec<u64> {
            self.state.lock().unwrap().issued.clone()
        }

        fn released(&self) -> Vec<u64> {
            self.state.lock().unwrap().released.clone()
        }
    }

    #[test]
    fn zero_period_rejected_without_registration() {
        let sched = ManualScheduler::default();
        let result = PeriodicTimer::schedule(sched.clone(), Duration::ZERO, || {});
        assert!(matches!(result, Err(PeriodicError::ZeroPeriod)));
        assert!(sched.issued().is_empty());
    }

    #[test]
    fn first_firing_due_one_period_out() {
        let sched = ManualScheduler::default();
        let before = Instant::now();
        let period = Duration::from_secs(5);
        let _timer = PeriodicTimer::schedule(sched.clone(), period, || {}).unwrap();

        let s = sched.state.lock().unwrap();
        assert_eq!(s.pending.len(), 1);
        let (_, due, _) = &s.pending[0];
        assert!(*due >= before + period);
    }

    #[test]
    fn rearms_and_releases_after_each_firing() {
        let sched = ManualScheduler::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let timer = PeriodicTimer::schedule(sched.clone(), Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        sched.fire_next();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // A fresh registration replaced the fired one, whose handle was
        // released exactly once.
        assert_eq!(sched.pending_len(), 1);
        assert_eq!(sched.released(), vec![1]);

        sched.fire_next();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(sched.released(), vec![1, 2]);

        timer.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(sched.pending_len(), 0);
        assert_eq!(sched.released(), vec![1, 2, 3]);
    }

    #[test]
    fn cancel_before_first_firing() {
        let sched = ManualScheduler::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let timer = PeriodicTimer::schedule(sched.clone(), Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        timer.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(sched.pending_len(), 0);
        assert_eq!(sched.issued(), vec![1]);
        assert_eq!(sched.released(), vec![1]);
    }

    #[test]
    fn every_handle_released_exactly_once() {
        let sched = ManualScheduler::default();
        let timer =
            PeriodicTimer::schedule(sched.clone(), Duration::from_millis(10), || {}).unwrap();

        for _ in 0..10 {
            sched.fire_next();
        }
        timer.cancel();

        let mut released = sched.released();
        released.sort_unstable();
        assert_eq!(released, sched.issued());
    }

    #[test]
    fn cancel_retries_until_rearm_is_caught() {
        let sched = ManualScheduler::default();
        let started = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&started);
        let counter = Arc::clone(&count);
        let timer = PeriodicTimer::schedule(sched.clone(), Duration::from_millis(20), move || {
            flag.store(true, Ordering::SeqCst);
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
        })
        .unwrap();

        // Run the first firing on another thread and cancel mid-run: the
        // first cancel attempts fail, the retry catches the re-armed
        // registration.
        let pump = thread::spawn({
            let sched = sched.clone();
            move || sched.fire_next()
        });
        while !started.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        timer.cancel();
        pump.join().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending_len(), 0);
        let mut released = sched.released();
        released.sort_unstable();
        assert_eq!(released, sched.issued());
    }

    #[test]
    fn delay_deducts_elapsed_within_period() {
        let period = Duration::from_secs(10);
        assert_eq!(
            next_delay(period, Duration::from_secs(3), Duration::from_secs(40)),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn delay_zero_when_run_consumed_exactly_one_period() {
        let period = Duration::from_secs(10);
        assert_eq!(
            next_delay(period, period, Duration::from_secs(20)),
            Duration::ZERO
        );
    }

    #[test]
    fn overrun_aligns_to_next_grid_boundary() {
        let period = Duration::from_secs(10);
        // Started 3s into a period, ran for 25s: next boundary is 7s after
        // the start grid position, never a burst of the two missed firings.
        assert_eq!(
            next_delay(period, Duration::from_secs(25), Duration::from_secs(13)),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn overrun_from_a_boundary_waits_one_full_period() {
        let period = Duration::from_secs(10);
        assert_eq!(
            next_delay(period, Duration::from_secs(25), Duration::from_secs(20)),
            period
        );
    }
}
