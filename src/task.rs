//! User work handles and the queue envelope wrapping them.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::ClockWrapper;
use crate::delay_queue::Delayed;
use crate::future::FutureWork;
use crate::priority::Priority;
use crate::scheduler::SchedulerCore;

/// A unit of work submitted to the pool.
///
/// `Job` is a cheaply clonable handle; clones share identity, and identity is
/// what [`PriorityScheduler::remove`](crate::PriorityScheduler::remove)
/// matches against. Keep a clone of the handle if the task may need to be
/// removed or re-submitted later.
#[derive(Clone)]
pub struct Job {
    inner: Arc<dyn Fn() + Send + Sync>,
}

impl Job {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Job { inner: Arc::new(f) }
    }

    /// Whether two handles refer to the same underlying work.
    pub fn same(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn call(&self) {
        (self.inner)();
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// Shared handle to a queued task envelope.
pub(crate) type TaskRef = Arc<TaskWrapper>;

/// The work carried by an envelope.
pub(crate) enum Work {
    /// A plain job handle.
    Plain(Job),
    /// A future-backed task created by the `submit*` family.
    Future(Arc<dyn FutureWork>),
    /// The graceful-shutdown marker; runs `shutdown_now` when it dequeues.
    Shutdown,
}

enum RecurringKind {
    /// Re-arms `rest_ms` after the body returns.
    FixedDelay { rest_ms: u64 },
    /// Re-arms on a fixed period regardless of body time (drift free).
    FixedRate { period_ms: u64 },
}

enum Timing {
    OneShot {
        /// Absolute monotonic due time.
        run_time_ms: u64,
    },
    Recurring {
        next_run_ms: AtomicU64,
        /// While set, the wrapper reports an unreachable delay so `take`
        /// never returns it; the queue parks it at the back instead.
        executing: AtomicBool,
        kind: RecurringKind,
    },
}

/// Envelope queued by the scheduler: work, priority, cancel flag, timing.
///
/// A recurring envelope lives in exactly one place at all times: its priority
/// queue, or parked at that queue's back (with the executing flag raised)
/// while the user body runs.
pub(crate) struct TaskWrapper {
    priority: Priority,
    canceled: AtomicBool,
    work: Work,
    timing: Timing,
    clock: Arc<ClockWrapper>,
}

impl TaskWrapper {
    pub fn one_shot(work: Work, priority: Priority, delay_ms: u64, clock: Arc<ClockWrapper>) -> Self {
        let run_time_ms = clock.accurate_millis() + delay_ms;
        TaskWrapper {
            priority,
            canceled: AtomicBool::new(false),
            work,
            timing: Timing::OneShot { run_time_ms },
            clock,
        }
    }

    pub fn recurring_delay(
        work: Work,
        priority: Priority,
        initial_delay_ms: u64,
        rest_ms: u64,
        clock: Arc<ClockWrapper>,
    ) -> Self {
        Self::recurring(
            work,
            priority,
            initial_delay_ms,
            RecurringKind::FixedDelay { rest_ms },
            clock,
        )
    }

    pub fn recurring_rate(
        work: Work,
        priority: Priority,
        initial_delay_ms: u64,
        period_ms: u64,
        clock: Arc<ClockWrapper>,
    ) -> Self {
        Self::recurring(
            work,
            priority,
            initial_delay_ms,
            RecurringKind::FixedRate { period_ms },
            clock,
        )
    }

    fn recurring(
        work: Work,
        priority: Priority,
        initial_delay_ms: u64,
        kind: RecurringKind,
        clock: Arc<ClockWrapper>,
    ) -> Self {
        let next_run_ms = clock.accurate_millis() + initial_delay_ms;
        TaskWrapper {
            priority,
            canceled: AtomicBool::new(false),
            work,
            timing: Timing::Recurring {
                next_run_ms: AtomicU64::new(next_run_ms),
                executing: AtomicBool::new(false),
                kind,
            },
            clock,
        }
    }

    pub fn shutdown_marker(clock: Arc<ClockWrapper>) -> Self {
        // Delayed one tick so tasks that are already due drain first.
        Self::one_shot(Work::Shutdown, Priority::High, 1, clock)
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn is_shutdown_marker(&self) -> bool {
        matches!(self.work, Work::Shutdown)
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.timing, Timing::Recurring { .. })
    }

    /// Flags the task canceled (one-way) and propagates into a wrapped
    /// future. Does not interrupt a running body.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        if let Work::Future(future) = &self.work {
            future.cancel();
        }
    }

    /// Remaining delay for queue ordering; effectively infinite while a
    /// recurring body is executing.
    pub fn delay_ms(&self) -> i64 {
        match &self.timing {
            Timing::OneShot { run_time_ms } => {
                *run_time_ms as i64 - self.clock.semi_accurate_millis() as i64
            }
            Timing::Recurring {
                next_run_ms,
                executing,
                ..
            } => {
                if executing.load(Ordering::Acquire) {
                    i64::MAX
                } else {
                    next_run_ms.load(Ordering::Acquire) as i64
                        - self.clock.semi_accurate_millis() as i64
                }
            }
        }
    }

    /// Cheap delay estimate off the cached clock; used by the dispatch
    /// fairness bookkeeping where slight inaccuracy is fine.
    pub fn delay_estimate_ms(&self) -> i64 {
        let reference = match &self.timing {
            Timing::OneShot { run_time_ms } => *run_time_ms,
            Timing::Recurring { next_run_ms, .. } => next_run_ms.load(Ordering::Acquire),
        };
        reference as i64 - self.clock.last_known_millis() as i64
    }

    /// Dequeue hook, invoked by the queue while its lock is held.
    ///
    /// Returns whether the envelope should be parked back at the queue's
    /// tail: true for a live recurring task entering execution, so it stays
    /// findable for `remove` but out of `take`'s way.
    pub fn on_dequeue(&self) -> bool {
        match &self.timing {
            Timing::OneShot { .. } => false,
            Timing::Recurring { executing, .. } => {
                if self.is_canceled() {
                    false
                } else {
                    executing.store(true, Ordering::Release);
                    true
                }
            }
        }
    }

    /// Fixes the next run time after the body finished.
    pub fn update_next_run_time(&self) {
        if let Timing::Recurring {
            next_run_ms, kind, ..
        } = &self.timing
        {
            match kind {
                RecurringKind::FixedDelay { rest_ms } => {
                    next_run_ms.store(self.clock.accurate_millis() + rest_ms, Ordering::Release);
                }
                RecurringKind::FixedRate { period_ms } => {
                    next_run_ms.fetch_add(*period_ms, Ordering::AcqRel);
                }
            }
        }
    }

    /// Delay to the (already updated) next run, ignoring the executing flag.
    pub fn next_run_delay_ms(&self) -> i64 {
        match &self.timing {
            Timing::OneShot { run_time_ms } => {
                *run_time_ms as i64 - self.clock.semi_accurate_millis() as i64
            }
            Timing::Recurring { next_run_ms, .. } => {
                next_run_ms.load(Ordering::Acquire) as i64
                    - self.clock.semi_accurate_millis() as i64
            }
        }
    }

    /// Clears the executing flag; called by the queue's reposition updater
    /// after removal, so no comparator can race the delay change.
    pub fn clear_executing(&self) {
        if let Timing::Recurring { executing, .. } = &self.timing {
            executing.store(false, Ordering::Release);
        }
    }

    /// Deep containment against the originally submitted job, through any
    /// future wrapper.
    pub fn contains(&self, target: &Job) -> bool {
        match &self.work {
            Work::Plain(job) => job.same(target),
            Work::Future(future) => future.inner_job().same(target),
            Work::Shutdown => false,
        }
    }

    /// The user-level job, for returning drained work out of `shutdown_now`.
    pub fn user_job(&self) -> Option<Job> {
        match &self.work {
            Work::Plain(job) => Some(job.clone()),
            Work::Future(future) => Some(future.inner_job()),
            Work::Shutdown => None,
        }
    }

    /// Executes the envelope on a worker thread.
    ///
    /// One-shot bodies run bare; a panic propagates to the worker's guard.
    /// Recurring bodies reschedule even when they panic, matching the
    /// run-then-reschedule contract, and the panic is then resumed so the
    /// worker's guard still reports it.
    pub fn run(self: &Arc<Self>, scheduler: &Arc<SchedulerCore>) {
        if self.is_canceled() {
            return;
        }
        match &self.timing {
            Timing::OneShot { .. } => self.run_body(scheduler),
            Timing::Recurring { .. } => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_body(scheduler)));
                if !self.is_canceled() {
                    scheduler.reposition_recurring(self);
                }
                if let Err(payload) = outcome {
                    panic::resume_unwind(payload);
                }
            }
        }
    }

    fn run_body(&self, scheduler: &Arc<SchedulerCore>) {
        match &self.work {
            Work::Plain(job) => job.call(),
            Work::Future(future) => future.run(),
            Work::Shutdown => {
                scheduler.shutdown_now();
            }
        }
    }
}

impl Delayed for TaskRef {
    fn delay_ms(&self) -> i64 {
        TaskWrapper::delay_ms(self)
    }

    fn same_item(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}
