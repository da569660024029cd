//! A deterministic, manually-advanced [`Scheduler`] for tests.
//!
//! Gated behind the `test-util` feature the way `tokio::time::pause`/
//! `advance` are feature-gated in `tokio-test` -- this is how the S1-S6
//! end-to-end scenarios assert ordering around `delay_execution`, `timeout`,
//! and `amb` without relying on real wall-clock sleeps in CI.
//!
//! [`VirtualScheduler::execute`] and [`VirtualScheduler::schedule_once`]
//! never run their argument inline; both simply enqueue it against the
//! scheduler's virtual clock (`execute` at the current instant,
//! `schedule_once` at `now + delay`). Nothing runs until
//! [`VirtualScheduler::advance`] is called, which moves the clock forward
//! and then drains every entry now due, including any the draining itself
//! schedules.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancelable::CancelToken;
use crate::error::{TaskError, TracingReporter, UncaughtExceptionReporter};
use crate::scheduler::{BoxRunnable, Scheduler};

struct Entry {
    deadline: Duration,
    seq: u64,
    canceled: Arc<AtomicBool>,
    runnable: BoxRunnable,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // `BinaryHeap` is a max-heap; reversing here (and popping via
        // `Reverse` at the call site) would be redundant with this, so
        // instead we just invert the natural order directly: the smallest
        // deadline/seq pair should compare as "greatest".
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

struct Inner {
    now: Duration,
    next_seq: u64,
    queue: BinaryHeap<Entry>,
}

/// A cancel token for a [`VirtualScheduler::schedule_once`] entry: flips an
/// `AtomicBool` the scheduler checks just before running the entry.
struct VirtualCancelToken(Arc<AtomicBool>);

impl CancelToken for VirtualCancelToken {
    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A [`Scheduler`] whose clock only moves when [`VirtualScheduler::advance`]
/// is called, so timeout/delay/race scenarios are fully deterministic.
pub struct VirtualScheduler {
    inner: Mutex<Inner>,
    reporter: Arc<dyn UncaughtExceptionReporter>,
    runnable_count: AtomicU64,
}

impl VirtualScheduler {
    /// A fresh scheduler with virtual time at zero, reporting uncaught
    /// failures via `tracing::error!`.
    pub fn new() -> Arc<Self> {
        Self::with_reporter(Arc::new(TracingReporter))
    }

    /// As [`VirtualScheduler::new`], with a caller-supplied reporter.
    pub fn with_reporter(reporter: Arc<dyn UncaughtExceptionReporter>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                now: Duration::ZERO,
                next_seq: 0,
                queue: BinaryHeap::new(),
            }),
            reporter,
            runnable_count: AtomicU64::new(0),
        })
    }

    /// The scheduler's current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).now
    }

    /// How many runnables have been submitted (via `execute` or
    /// `schedule_once`) over this scheduler's lifetime, canceled or not.
    /// Useful for asserting e.g. retry attempt counts in tests.
    pub fn submitted_count(&self) -> u64 {
        self.runnable_count.load(Ordering::Acquire)
    }

    /// Move the virtual clock forward by `delta` and run every entry now
    /// due, in `(deadline, submission order)`, including entries newly
    /// scheduled by the draining itself.
    pub fn advance(&self, delta: Duration) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.now += delta;
        }
        self.drain();
    }

    /// Drain every entry already due without moving the clock -- equivalent
    /// to `advance(Duration::ZERO)`, for flushing immediate (`execute`)
    /// work before asserting on it.
    pub fn run_ready(&self) {
        self.drain();
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                let due = matches!(inner.queue.peek(), Some(entry) if entry.deadline <= inner.now);
                if due {
                    inner.queue.pop()
                } else {
                    None
                }
            };
            match next {
                Some(entry) => {
                    if !entry.canceled.load(Ordering::Acquire) {
                        (entry.runnable)();
                    }
                }
                None => break,
            }
        }
    }

    fn push(&self, deadline: Duration, runnable: BoxRunnable) -> Arc<AtomicBool> {
        self.runnable_count.fetch_add(1, Ordering::AcqRel);
        let canceled = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.push(Entry {
            deadline,
            seq,
            canceled: canceled.clone(),
            runnable,
        });
        canceled
    }
}

impl Scheduler for VirtualScheduler {
    fn execute(&self, runnable: BoxRunnable) {
        let now = self.now();
        self.push(now, runnable);
    }

    fn schedule_once(&self, delay: Duration, runnable: BoxRunnable) -> Arc<dyn CancelToken> {
        let deadline = self.now() + delay;
        let canceled = self.push(deadline, runnable);
        Arc::new(VirtualCancelToken(canceled))
    }

    fn report_failure(&self, error: TaskError) {
        self.reporter.report_failure(error);
    }

    fn is_always_async(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn execute_does_not_run_until_drained() {
        let scheduler = VirtualScheduler::new();
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        scheduler.execute(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        scheduler.run_ready();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_once_fires_only_once_the_clock_reaches_it() {
        let scheduler = VirtualScheduler::new();
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        scheduler.schedule_once(
            Duration::from_millis(10),
            Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.advance(Duration::from_millis(5));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        scheduler.advance(Duration::from_millis(5));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_canceled_entry_never_runs() {
        let scheduler = VirtualScheduler::new();
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        let token = scheduler.schedule_once(
            Duration::from_millis(10),
            Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        token.cancel();
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn entries_run_in_deadline_then_submission_order() {
        let scheduler = VirtualScheduler::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mark = |order: Arc<std::sync::Mutex<Vec<&'static str>>>, label: &'static str| {
            move || order.lock().unwrap().push(label)
        };
        scheduler.schedule_once(Duration::from_millis(10), Box::new(mark(order.clone(), "b")));
        scheduler.execute(Box::new(mark(order.clone(), "a")));
        scheduler.schedule_once(Duration::from_millis(5), Box::new(mark(order.clone(), "c")));
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(*order.lock().unwrap(), vec!["a", "c", "b"]);
    }

    #[test]
    fn submitted_count_tracks_every_push_including_canceled_ones() {
        let scheduler = VirtualScheduler::new();
        scheduler.execute(Box::new(|| {}));
        let token = scheduler.schedule_once(Duration::from_millis(1), Box::new(|| {}));
        token.cancel();
        assert_eq!(scheduler.submitted_count(), 2);
    }
}
