//! Elastic two-priority scheduler: pool sizing, admission, and dispatch.
//!
//! The pool grows from its core size toward the maximum under demand and
//! shrinks back as workers idle past the keep-alive. High priority dispatch
//! takes or creates a worker immediately; low priority dispatch defers to
//! older high priority tasks within a bounded tolerance, then prefers warm
//! workers over thread creation. Lock order is strict:
//! `pool_size_change` → pool lock; the per-queue locks never nest with the
//! pool lock or each other.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::clock::ClockWrapper;
use crate::config::{SchedulerBuilder, SchedulerConfig, ThreadFactory};
use crate::consumer::TaskConsumer;
use crate::delay_queue::DelayQueue;
use crate::error::TaskError;
use crate::future::{FutureTask, FutureWork, JobExecutor, ListenableFuture};
use crate::priority::{Priority, PriorityTable};
use crate::task::{Job, TaskRef, TaskWrapper, Work};
use crate::worker::{Worker, WorkerHost};

/// Idle-worker count below which the pool is considered contended.
const WORKER_CONTENTION_LEVEL: usize = 2;
/// Slack granted to low priority tasks before they defer to older highs.
const LOW_PRIORITY_WAIT_TOLERANCE_MS: i64 = 2;
/// Sentinel for an unbounded worker wait.
const FOREVER_MS: u64 = u64::MAX;

/// State guarded by the pool lock.
struct PoolState {
    /// Total live workers, idle or busy.
    current_pool_size: usize,
    /// Idle workers; newest pushed to the front, expired from the back.
    available_workers: VecDeque<Arc<Worker>>,
    /// Dispatch threads currently blocked awaiting a worker.
    waiting_for_worker: usize,
    /// Of those, how many are high priority dispatches. A contended worker
    /// always goes to a waiting high dispatch before a waiting low one.
    waiting_high: usize,
    /// Queueing delay of the last high priority task that had to wait;
    /// consulted by the low priority admission rule.
    last_high_delay_ms: i64,
}

/// Shared scheduler internals; the public handle is [`PriorityScheduler`].
pub(crate) struct SchedulerCore {
    self_ref: Weak<SchedulerCore>,
    clock: Arc<ClockWrapper>,
    thread_factory: Arc<dyn ThreadFactory>,
    queues: PriorityTable<DelayQueue<TaskRef>>,
    consumers: PriorityTable<TaskConsumer>,
    pool: Mutex<PoolState>,
    worker_available: Condvar,
    pool_size_change: Mutex<()>,
    shutdown_started: AtomicBool,
    shutdown_finishing: AtomicBool,
    core_pool_size: AtomicUsize,
    max_pool_size: AtomicUsize,
    keep_alive_ms: AtomicU64,
    max_wait_low_ms: AtomicU64,
    allow_core_timeout: AtomicBool,
    worker_counter: AtomicUsize,
}

impl SchedulerCore {
    fn new(config: &SchedulerConfig, thread_factory: Arc<dyn ThreadFactory>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| SchedulerCore {
            self_ref: self_ref.clone(),
            clock: Arc::new(ClockWrapper::new()),
            thread_factory,
            queues: PriorityTable::from_fn(|_| DelayQueue::new()),
            consumers: PriorityTable::from_fn(|priority| {
                TaskConsumer::new(format!("taskmill-{priority}-consumer"))
            }),
            pool: Mutex::new(PoolState {
                current_pool_size: 0,
                available_workers: VecDeque::with_capacity(config.core_pool_size),
                waiting_for_worker: 0,
                waiting_high: 0,
                last_high_delay_ms: 0,
            }),
            worker_available: Condvar::new(),
            pool_size_change: Mutex::new(()),
            shutdown_started: AtomicBool::new(false),
            shutdown_finishing: AtomicBool::new(false),
            core_pool_size: AtomicUsize::new(config.core_pool_size),
            max_pool_size: AtomicUsize::new(config.max_pool_size),
            keep_alive_ms: AtomicU64::new(config.keep_alive_time_ms),
            max_wait_low_ms: AtomicU64::new(config.max_wait_for_low_priority_ms),
            allow_core_timeout: AtomicBool::new(config.allow_core_thread_timeout),
            worker_counter: AtomicUsize::new(0),
        })
    }

    fn arc(&self) -> Arc<SchedulerCore> {
        self.self_ref
            .upgrade()
            .expect("scheduler core outlives its users")
    }

    pub(crate) fn clock(&self) -> &Arc<ClockWrapper> {
        &self.clock
    }

    fn core_size(&self) -> usize {
        self.core_pool_size.load(Ordering::Acquire)
    }

    fn max_size(&self) -> usize {
        self.max_pool_size.load(Ordering::Acquire)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }

    fn is_finishing(&self) -> bool {
        self.shutdown_finishing.load(Ordering::Acquire)
    }

    // ---- queueing ----

    fn add_to_queue(&self, task: TaskWrapper) -> Result<(), TaskError> {
        if self.is_shutdown() {
            return Err(TaskError::Rejected);
        }
        self.enqueue(Arc::new(task));
        Ok(())
    }

    fn enqueue(&self, task: TaskRef) {
        let priority = task.priority();
        {
            // Freeze the clock so every comparison in this insert sees the
            // same instant.
            let _hold = self.clock.hold();
            self.queues[priority].add(task);
        }
        self.start_consumer(priority);
    }

    fn start_consumer(&self, priority: Priority) {
        let consumer = &self.consumers[priority];
        let stopped = consumer.stopped_flag();
        let core = self.arc();
        consumer.start_if_not_started(self.thread_factory.as_ref(), move || {
            core.consume_loop(priority, stopped);
        });
    }

    fn consume_loop(self: Arc<Self>, priority: Priority, stopped: Arc<AtomicBool>) {
        loop {
            // The dequeue hook runs under the queue lock: recurring wrappers
            // flip to executing and get parked at the tail there.
            let Some(task) = self.queues[priority].take(&stopped, |task| task.on_dequeue())
            else {
                break;
            };
            match priority {
                Priority::High => self.run_high_priority_task(task),
                Priority::Low => self.run_low_priority_task(task),
            }
        }
        tracing::debug!(%priority, "queue consumer stopped");
    }

    /// Re-sorts a recurring wrapper after its body finished.
    ///
    /// Skipped silently once shutdown has started. A miss is tolerated only
    /// when the wrapper was canceled underneath us (shutdown tearing the
    /// queue down mid-reschedule); anything else means the single-presence
    /// invariant broke.
    pub(crate) fn reposition_recurring(&self, task: &TaskRef) {
        task.update_next_run_time();
        if self.is_shutdown() {
            return;
        }
        let priority = task.priority();
        let _hold = self.clock.hold();
        let mut placement = task.next_run_delay_ms();
        if priority == Priority::Low && placement < 0 {
            placement = 0;
        }
        let found = self.queues[priority].reposition(task, placement, || task.clear_executing());
        if !found && !task.is_canceled() {
            panic!("recurring task missing from its queue during reschedule");
        }
    }

    fn remove(&self, job: &Job) -> bool {
        for priority in Priority::ALL {
            if let Some(task) = self.queues[priority].remove_where(|task| task.contains(job)) {
                task.cancel();
                return true;
            }
        }
        false
    }

    // ---- dispatch ----

    /// Hands a due high priority task to a worker, growing the pool to its
    /// maximum before ever making the task wait.
    fn run_high_priority_task(&self, task: TaskRef) {
        let mut worker = None;
        {
            let mut state = self.pool.lock();
            if !self.is_finishing() {
                if state.current_pool_size >= self.max_size() {
                    // Pool can't grow; remember how long this task had been
                    // waiting for the low priority admission rule.
                    state.last_high_delay_ms = task.delay_estimate_ms();
                    worker = self.get_existing_worker(&mut state, FOREVER_MS, Priority::High);
                } else {
                    state.last_high_delay_ms = 0;
                    worker = Some(match state.available_workers.pop_front() {
                        Some(existing) => existing,
                        None => self.make_new_worker(&mut state),
                    });
                }
            }
        }
        if let Some(worker) = worker {
            worker.assign(task);
        }
        // A task left unassigned here was raced by shutdown; it is dropped.
    }

    /// Hands a due low priority task to a worker, deferring to older high
    /// priority tasks within the tolerance and preferring warm workers over
    /// pool growth.
    fn run_low_priority_task(&self, task: TaskRef) {
        let mut worker = None;
        {
            let mut state = self.pool.lock();
            if !self.is_finishing() {
                // Wait for high priority tasks that have been queued longer,
                // but only while workers are actually contended.
                loop {
                    if state.current_pool_size < self.max_size()
                        || state.available_workers.len() >= WORKER_CONTENTION_LEVEL
                        || self.is_finishing()
                        || self.queues[Priority::High].is_empty()
                    {
                        break;
                    }
                    let wait_ms = task.delay_estimate_ms() - state.last_high_delay_ms;
                    if wait_ms <= LOW_PRIORITY_WAIT_TOLERANCE_MS {
                        break;
                    }
                    self.worker_available
                        .wait_for(&mut state, Duration::from_millis(wait_ms as u64));
                    // Refresh the cached clock for the next delay estimate.
                    self.clock.accurate_millis();
                }
                if self.queues[Priority::High].is_empty() {
                    state.last_high_delay_ms = 0;
                }
                if !self.is_finishing() {
                    worker = if state.current_pool_size >= self.max_size() {
                        self.get_existing_worker(&mut state, FOREVER_MS, Priority::Low)
                    } else if state.current_pool_size == 0 {
                        // First task is low priority; nobody will ever hand
                        // us a worker if we wait, so make one.
                        Some(self.make_new_worker(&mut state))
                    } else {
                        let max_wait = self.max_wait_low_ms.load(Ordering::Acquire);
                        match self.get_existing_worker(&mut state, max_wait, Priority::Low) {
                            Some(existing) => Some(existing),
                            None => {
                                // Wait expired. The pool may have filled up
                                // while we waited; re-check before growing.
                                if state.current_pool_size >= self.max_size() {
                                    self.get_existing_worker(&mut state, FOREVER_MS, Priority::Low)
                                } else {
                                    Some(self.make_new_worker(&mut state))
                                }
                            }
                        }
                    };
                }
            }
        }
        if let Some(worker) = worker {
            worker.assign(task);
        }
    }

    /// Waits up to `max_wait_ms` for an idle worker. Never creates one.
    /// Requires the pool lock, passed as the guard.
    ///
    /// A low priority wait also yields while a high priority dispatch is
    /// blocked: a contended worker always goes to the high dispatch first.
    fn get_existing_worker(
        &self,
        state: &mut MutexGuard<'_, PoolState>,
        max_wait_ms: u64,
        priority: Priority,
    ) -> Option<Arc<Worker>> {
        state.waiting_for_worker += 1;
        if priority == Priority::High {
            state.waiting_high += 1;
        }
        let mut start_time: Option<u64> = None;
        let mut wait_remaining = max_wait_ms;
        while (state.available_workers.is_empty()
            || (priority == Priority::Low && state.waiting_high > 0))
            && wait_remaining > 0
            && !self.is_finishing()
        {
            let now = self.clock.accurate_millis();
            let started = *start_time.get_or_insert(now);
            if max_wait_ms == FOREVER_MS {
                self.worker_available.wait(state);
            } else {
                wait_remaining = max_wait_ms.saturating_sub(now - started);
                if wait_remaining > 0 {
                    self.worker_available
                        .wait_for(state, Duration::from_millis(wait_remaining));
                }
            }
        }
        state.waiting_for_worker -= 1;
        if priority == Priority::High {
            state.waiting_high -= 1;
        }
        if priority == Priority::Low && state.waiting_high > 0 {
            // Timed out while a high dispatch is still waiting; let the
            // caller grow the pool instead of stealing the worker.
            None
        } else {
            state.available_workers.pop_front()
        }
    }

    /// Creates and starts a worker without adding it to the idle deque, so
    /// the caller can assign to it immediately. Requires the pool lock.
    fn make_new_worker(&self, state: &mut PoolState) -> Arc<Worker> {
        let worker = Worker::new(self.clock.last_known_millis());
        state.current_pool_size += 1;
        let id = self.worker_counter.fetch_add(1, Ordering::Relaxed);
        let host: Arc<dyn WorkerHost> = self.arc();
        worker
            .start(
                host,
                self.thread_factory.as_ref(),
                format!("taskmill-worker-{id}"),
            )
            .expect("failed to spawn worker thread");
        worker
    }

    /// Kills idle workers from the cold end of the deque. Requires the pool
    /// lock.
    fn expire_old_workers(&self, state: &mut PoolState) {
        let now = self.clock.last_known_millis();
        while state.current_pool_size > self.core_size()
            || self.allow_core_timeout.load(Ordering::Acquire)
        {
            let Some(oldest) = state.available_workers.back() else {
                break;
            };
            // Above a lowered max, age does not matter.
            let expired = now.saturating_sub(oldest.last_run_ms())
                > self.keep_alive_ms.load(Ordering::Acquire)
                || state.current_pool_size > self.max_size();
            if !expired {
                break;
            }
            let worker = state.available_workers.pop_back().expect("checked above");
            self.kill_worker(state, &worker);
            tracing::debug!("expired idle worker");
        }
    }

    /// Stops a worker and forgets it. Requires the pool lock; the stop/
    /// decrement pairing guarantees the pool size drops exactly once per
    /// worker.
    fn kill_worker(&self, state: &mut PoolState, worker: &Arc<Worker>) {
        if worker.stop() {
            state.current_pool_size -= 1;
        }
        state
            .available_workers
            .retain(|other| !Arc::ptr_eq(other, worker));
    }

    fn return_worker(&self, worker: Arc<Worker>) {
        let mut state = self.pool.lock();
        if self.is_finishing() {
            self.kill_worker(&mut state, &worker);
        } else {
            self.expire_old_workers(&mut state);
            // Front insertion keeps the hottest workers working. Wake every
            // waiter: a low dispatch that wins the race would otherwise
            // swallow the wakeup a blocked high dispatch needed.
            state.available_workers.push_front(worker);
            self.worker_available.notify_all();
        }
    }

    // ---- pool reconfiguration ----

    fn set_core_pool_size(&self, size: usize) -> Result<(), TaskError> {
        if size == 0 {
            return Err(TaskError::InvalidArgument("core_pool_size must be at least one"));
        }
        let _guard = self.pool_size_change.lock();
        let shrink = self.core_size() > size;
        if self.max_size() < size {
            self.apply_max_pool_size(size);
        }
        self.core_pool_size.store(size, Ordering::Release);
        if shrink {
            let mut state = self.pool.lock();
            self.expire_old_workers(&mut state);
        }
        Ok(())
    }

    fn set_max_pool_size(&self, size: usize) -> Result<(), TaskError> {
        if size == 0 {
            return Err(TaskError::InvalidArgument("max_pool_size must be at least one"));
        }
        let _guard = self.pool_size_change.lock();
        self.apply_max_pool_size(size);
        Ok(())
    }

    /// Requires the pool-size-change lock.
    fn apply_max_pool_size(&self, size: usize) {
        let increase = size > self.max_size();
        if size < self.core_size() {
            self.core_pool_size.store(size, Ordering::Release);
        }
        self.max_pool_size.store(size, Ordering::Release);

        let mut state = self.pool.lock();
        if increase {
            if state.waiting_for_worker > 0 {
                // Start workers for blocked dispatches, capped at the actual
                // number of waiters.
                while state.available_workers.len() < state.waiting_for_worker
                    && state.current_pool_size < size
                {
                    let worker = self.make_new_worker(&mut state);
                    state.available_workers.push_back(worker);
                }
                self.worker_available.notify_all();
            }
        } else {
            self.expire_old_workers(&mut state);
        }
    }

    fn set_keep_alive_time(&self, keep_alive_ms: u64) {
        let reduced = self.keep_alive_ms.load(Ordering::Acquire) > keep_alive_ms;
        self.keep_alive_ms.store(keep_alive_ms, Ordering::Release);
        if reduced {
            let mut state = self.pool.lock();
            self.expire_old_workers(&mut state);
        }
    }

    fn allow_core_thread_timeout(&self, value: bool) {
        let check = !self.allow_core_timeout.load(Ordering::Acquire) && value;
        self.allow_core_timeout.store(value, Ordering::Release);
        if check {
            let mut state = self.pool.lock();
            self.expire_old_workers(&mut state);
        }
    }

    fn prestart_all_core_threads(&self) {
        let mut state = self.pool.lock();
        let mut started = false;
        while state.current_pool_size < self.core_size() {
            let worker = self.make_new_worker(&mut state);
            state.available_workers.push_front(worker);
            started = true;
        }
        if started {
            self.worker_available.notify_all();
        }
    }

    // ---- shutdown ----

    fn shutdown(&self) {
        if !self.shutdown_started.swap(true, Ordering::AcqRel) {
            tracing::debug!("graceful shutdown started");
            // The marker drains behind everything already due; running it
            // finishes the shutdown.
            let marker = TaskWrapper::shutdown_marker(self.clock.clone());
            self.enqueue(Arc::new(marker));
        }
    }

    pub(crate) fn shutdown_now(&self) -> Vec<Job> {
        self.shutdown_started.store(true, Ordering::Release);
        self.shutdown_finishing.store(true, Ordering::Release);
        let removed = self.clear_task_queue();
        self.shutdown_all_workers();
        tracing::debug!(drained = removed.len(), "immediate shutdown");
        removed
    }

    /// Stops the consumers and empties both queues, returning the user jobs
    /// that never ran (minus the shutdown marker).
    fn clear_task_queue(&self) -> Vec<Job> {
        for priority in Priority::ALL {
            self.consumers[priority].stop_if_running();
            self.queues[priority].wake_all();
        }
        let mut removed = Vec::new();
        for priority in Priority::ALL {
            for task in self.queues[priority].drain() {
                task.cancel();
                if !task.is_shutdown_marker() {
                    if let Some(job) = task.user_job() {
                        removed.push(job);
                    }
                }
            }
        }
        removed
    }

    fn shutdown_all_workers(&self) {
        let mut state = self.pool.lock();
        while let Some(worker) = state.available_workers.pop_front() {
            if worker.stop() {
                state.current_pool_size -= 1;
            }
        }
        // Wake anything blocked awaiting a worker so it can observe shutdown.
        self.worker_available.notify_all();
    }
}

impl WorkerHost for SchedulerCore {
    fn run_task(&self, task: &TaskRef) {
        let core = self.arc();
        task.run(&core);
    }

    fn worker_done(&self, worker: Arc<Worker>) {
        self.return_worker(worker);
    }

    fn now_ms(&self) -> u64 {
        self.clock.last_known_millis()
    }
}

/// Elastic thread pool executing one-shot and recurring tasks in two
/// priority classes.
///
/// Handles are cheap to clone and share one pool. See the crate docs for an
/// overview and [`SchedulerBuilder`] for the full set of tunables.
#[derive(Clone)]
pub struct PriorityScheduler {
    core: Arc<SchedulerCore>,
    default_priority: Priority,
}

impl PriorityScheduler {
    /// Creates a pool with the given sizing; remaining tunables take their
    /// defaults. No threads start until the first submission.
    pub fn new(
        core_pool_size: usize,
        max_pool_size: usize,
        keep_alive_time: Duration,
    ) -> Result<Self, TaskError> {
        SchedulerBuilder::new()
            .core_pool_size(core_pool_size)
            .max_pool_size(max_pool_size)
            .keep_alive_time(keep_alive_time)
            .build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub(crate) fn from_parts(config: SchedulerConfig, factory: Arc<dyn ThreadFactory>) -> Self {
        let core = SchedulerCore::new(&config, factory);
        PriorityScheduler {
            core,
            default_priority: config.default_priority,
        }
    }

    /// A handle sharing this pool but substituting the default priority used
    /// by the priority-less submission methods.
    pub fn with_default_priority(&self, priority: Priority) -> PriorityScheduler {
        PriorityScheduler {
            core: self.core.clone(),
            default_priority: priority,
        }
    }

    pub fn default_priority(&self) -> Priority {
        self.default_priority
    }

    // ---- submission ----

    /// Runs the job as soon as a worker can take it.
    pub fn execute(&self, job: Job) -> Result<(), TaskError> {
        self.execute_with_priority(job, self.default_priority)
    }

    pub fn execute_with_priority(&self, job: Job, priority: Priority) -> Result<(), TaskError> {
        self.schedule_with_priority(job, Duration::ZERO, priority)
    }

    /// Runs the job once after `delay`.
    pub fn schedule(&self, job: Job, delay: Duration) -> Result<(), TaskError> {
        self.schedule_with_priority(job, delay, self.default_priority)
    }

    pub fn schedule_with_priority(
        &self,
        job: Job,
        delay: Duration,
        priority: Priority,
    ) -> Result<(), TaskError> {
        self.core.add_to_queue(TaskWrapper::one_shot(
            Work::Plain(job),
            priority,
            delay.as_millis() as u64,
            self.core.clock().clone(),
        ))
    }

    /// Runs the job repeatedly, resting `recurring_delay` after each
    /// completion before the next run.
    pub fn schedule_with_fixed_delay(
        &self,
        job: Job,
        initial_delay: Duration,
        recurring_delay: Duration,
    ) -> Result<(), TaskError> {
        self.schedule_with_fixed_delay_and_priority(
            job,
            initial_delay,
            recurring_delay,
            self.default_priority,
        )
    }

    pub fn schedule_with_fixed_delay_and_priority(
        &self,
        job: Job,
        initial_delay: Duration,
        recurring_delay: Duration,
        priority: Priority,
    ) -> Result<(), TaskError> {
        self.core.add_to_queue(TaskWrapper::recurring_delay(
            Work::Plain(job),
            priority,
            initial_delay.as_millis() as u64,
            recurring_delay.as_millis() as u64,
            self.core.clock().clone(),
        ))
    }

    /// Runs the job on a fixed period measured from schedule time,
    /// independent of how long each body takes.
    pub fn schedule_at_fixed_rate(
        &self,
        job: Job,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<(), TaskError> {
        self.schedule_at_fixed_rate_with_priority(job, initial_delay, period, self.default_priority)
    }

    pub fn schedule_at_fixed_rate_with_priority(
        &self,
        job: Job,
        initial_delay: Duration,
        period: Duration,
        priority: Priority,
    ) -> Result<(), TaskError> {
        if period.is_zero() {
            return Err(TaskError::InvalidArgument("period must be greater than zero"));
        }
        self.core.add_to_queue(TaskWrapper::recurring_rate(
            Work::Plain(job),
            priority,
            initial_delay.as_millis() as u64,
            period.as_millis() as u64,
            self.core.clock().clone(),
        ))
    }

    /// Like [`execute`](Self::execute) but returns a future completing when
    /// the body returns or panics.
    pub fn submit(&self, job: Job) -> Result<ListenableFuture<()>, TaskError> {
        self.submit_scheduled(job, Duration::ZERO)
    }

    pub fn submit_with_priority(
        &self,
        job: Job,
        priority: Priority,
    ) -> Result<ListenableFuture<()>, TaskError> {
        self.submit_scheduled_with_result_and_priority(job, (), Duration::ZERO, priority)
    }

    pub fn submit_scheduled(
        &self,
        job: Job,
        delay: Duration,
    ) -> Result<ListenableFuture<()>, TaskError> {
        self.submit_scheduled_with_result_and_priority(job, (), delay, self.default_priority)
    }

    /// Promise-style submission: the future resolves to `result` once the
    /// body has run.
    pub fn submit_with_result<T>(&self, job: Job, result: T) -> Result<ListenableFuture<T>, TaskError>
    where
        T: Clone + Send + 'static,
    {
        self.submit_scheduled_with_result_and_priority(job, result, Duration::ZERO, self.default_priority)
    }

    pub fn submit_scheduled_with_result<T>(
        &self,
        job: Job,
        result: T,
        delay: Duration,
    ) -> Result<ListenableFuture<T>, TaskError>
    where
        T: Clone + Send + 'static,
    {
        self.submit_scheduled_with_result_and_priority(job, result, delay, self.default_priority)
    }

    pub fn submit_scheduled_with_result_and_priority<T>(
        &self,
        job: Job,
        result: T,
        delay: Duration,
        priority: Priority,
    ) -> Result<ListenableFuture<T>, TaskError>
    where
        T: Clone + Send + 'static,
    {
        let task = FutureTask::new(job, result);
        let future = task.future();
        let work: Arc<dyn FutureWork> = task;
        self.core.add_to_queue(TaskWrapper::one_shot(
            Work::Future(work),
            priority,
            delay.as_millis() as u64,
            self.core.clock().clone(),
        ))?;
        Ok(future)
    }

    /// Cancels and removes the first queued task wrapping `job`, searching
    /// the high priority queue first. Matching is by job identity, through
    /// future wrappers. A task already handed to a worker may still run.
    pub fn remove(&self, job: &Job) -> bool {
        self.core.remove(job)
    }

    // ---- shutdown ----

    /// Stops new submissions; everything already queued still drains. Safe
    /// to call more than once.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Stops new submissions and clears both queues, returning the user
    /// jobs that never started. Running tasks finish normally; no thread is
    /// interrupted.
    pub fn shutdown_now(&self) -> Vec<Job> {
        self.core.shutdown_now()
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    // ---- introspection and tuning ----

    pub fn core_pool_size(&self) -> usize {
        self.core.core_size()
    }

    pub fn max_pool_size(&self) -> usize {
        self.core.max_size()
    }

    pub fn keep_alive_time(&self) -> Duration {
        Duration::from_millis(self.core.keep_alive_ms.load(Ordering::Acquire))
    }

    pub fn max_wait_for_low_priority(&self) -> Duration {
        Duration::from_millis(self.core.max_wait_low_ms.load(Ordering::Acquire))
    }

    /// Workers currently constructed, idle or busy.
    pub fn current_pool_size(&self) -> usize {
        self.core.pool.lock().current_pool_size
    }

    /// Tasks being executed right now.
    pub fn current_running_count(&self) -> usize {
        let state = self.core.pool.lock();
        state.current_pool_size - state.available_workers.len()
    }

    /// Tasks waiting to execute or scheduled for later, both priorities.
    pub fn scheduled_task_count(&self) -> usize {
        Priority::ALL
            .iter()
            .map(|p| self.core.queues[*p].len())
            .sum()
    }

    pub fn scheduled_task_count_for(&self, priority: Priority) -> usize {
        self.core.queues[priority].len()
    }

    /// Raising the core size can start workers; lowering it expires idle
    /// ones. Max pool size follows if it would fall below the new core.
    pub fn set_core_pool_size(&self, size: usize) -> Result<(), TaskError> {
        self.core.set_core_pool_size(size)
    }

    /// Lowering never interrupts running workers; they retire as they
    /// finish. Raising starts workers for dispatches already blocked.
    pub fn set_max_pool_size(&self, size: usize) -> Result<(), TaskError> {
        self.core.set_max_pool_size(size)
    }

    pub fn set_keep_alive_time(&self, keep_alive: Duration) {
        self.core.set_keep_alive_time(keep_alive.as_millis() as u64);
    }

    /// Takes effect for future low priority dispatches only.
    pub fn set_max_wait_for_low_priority(&self, wait: Duration) {
        self.core
            .max_wait_low_ms
            .store(wait.as_millis() as u64, Ordering::Release);
    }

    pub fn allow_core_thread_timeout(&self, value: bool) {
        self.core.allow_core_thread_timeout(value);
    }

    /// Eagerly creates idle workers up to the core size.
    pub fn prestart_all_core_threads(&self) {
        self.core.prestart_all_core_threads();
    }
}

impl JobExecutor for PriorityScheduler {
    fn execute_job(&self, job: Job) -> Result<(), TaskError> {
        self.execute(job)
    }
}
