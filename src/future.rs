//! Completion-notification futures for the `submit*` submission family.

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::error::{panic_message, run_job_guarded, TaskError};
use crate::task::Job;

/// Anything that can run a job somewhere else; implemented by the scheduler
/// and the per-key façade so listeners can be dispatched off the completing
/// thread.
pub trait JobExecutor: Send + Sync {
    fn execute_job(&self, job: Job) -> Result<(), TaskError>;
}

/// How a submitted task failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FutureError {
    /// The task was canceled before its body started.
    #[error("task was canceled")]
    Canceled,
    /// The task body panicked; the message is the rendered payload.
    #[error("task panicked: {0}")]
    Panicked(String),
}

struct HelperState {
    called: bool,
    listeners: Vec<(Job, Option<Arc<dyn JobExecutor>>)>,
}

/// Listener registry with run-once or repeatable semantics.
///
/// Listeners registered before [`call_listeners`](Self::call_listeners) run
/// on that call; for a run-once helper, listeners registered afterwards run
/// immediately at registration. Calls run against a snapshot taken under the
/// lock and executed outside it, so a listener may add, remove, or clear
/// listeners reentrantly; additions made during a call do not run in that
/// pass.
pub struct ListenerHelper {
    call_once: bool,
    state: Mutex<HelperState>,
}

impl ListenerHelper {
    pub fn new(call_once: bool) -> Self {
        ListenerHelper {
            call_once,
            state: Mutex::new(HelperState {
                called: false,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn add_listener(&self, listener: Job) {
        self.add_listener_via(listener, None);
    }

    /// Registers a listener, optionally with an executor to run it on.
    pub fn add_listener_via(&self, listener: Job, executor: Option<Arc<dyn JobExecutor>>) {
        let run_now = {
            let mut state = self.state.lock();
            if self.call_once && state.called {
                true
            } else {
                state.listeners.push((listener.clone(), executor.clone()));
                false
            }
        };
        if run_now {
            Self::run_listener(&listener, executor.as_deref(), true);
        }
    }

    /// Unregisters the first listener with the same identity.
    pub fn remove_listener(&self, listener: &Job) -> bool {
        let mut state = self.state.lock();
        match state
            .listeners
            .iter()
            .position(|(registered, _)| registered.same(listener))
        {
            Some(position) => {
                state.listeners.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn clear_listeners(&self) {
        self.state.lock().listeners.clear();
    }

    pub fn registered_listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Runs the registered listeners.
    ///
    /// A run-once helper clears its list and refuses a second call; a
    /// repeatable helper keeps the list and may be called again. Listener
    /// panics are routed to the uncaught hook, never to the caller.
    ///
    /// # Panics
    /// When invoked a second time on a run-once helper.
    pub fn call_listeners(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            if self.call_once {
                assert!(!state.called, "listeners already called for a run-once helper");
                state.called = true;
                std::mem::take(&mut state.listeners)
            } else {
                state.called = true;
                state.listeners.clone()
            }
        };
        for (listener, executor) in snapshot {
            Self::run_listener(&listener, executor.as_deref(), false);
        }
    }

    /// Runs one listener inline or via its executor.
    ///
    /// With `rethrow`, a panic from an inline listener propagates to the
    /// caller; otherwise it is forwarded to the uncaught hook. A rejected
    /// executor dispatch is logged and dropped.
    pub fn run_listener(listener: &Job, executor: Option<&dyn JobExecutor>, rethrow: bool) {
        match executor {
            Some(executor) => {
                if let Err(error) = executor.execute_job(listener.clone()) {
                    tracing::warn!(%error, "listener executor rejected the dispatch");
                }
            }
            None => {
                if rethrow {
                    listener.call();
                } else {
                    run_job_guarded(listener);
                }
            }
        }
    }
}

enum FutureState<T> {
    Pending,
    Complete(Result<T, FutureError>),
}

struct FutureShared<T> {
    state: Mutex<FutureState<T>>,
    done: Condvar,
    listeners: ListenerHelper,
    canceled: AtomicBool,
}

impl<T> FutureShared<T> {
    fn new() -> Arc<Self> {
        Arc::new(FutureShared {
            state: Mutex::new(FutureState::Pending),
            done: Condvar::new(),
            listeners: ListenerHelper::new(true),
            canceled: AtomicBool::new(false),
        })
    }

    /// First completion wins; later attempts are ignored.
    fn complete(&self, outcome: Result<T, FutureError>, mark_canceled: bool) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(*state, FutureState::Complete(_)) {
                return false;
            }
            if mark_canceled {
                self.canceled.store(true, Ordering::Release);
            }
            *state = FutureState::Complete(outcome);
        }
        self.done.notify_all();
        self.listeners.call_listeners();
        true
    }
}

/// Handle to the eventual outcome of a `submit*` task.
///
/// Clones share the same completion. Listeners registered before completion
/// fire on completion (on the completing thread or via a supplied executor);
/// listeners registered after completion fire immediately.
pub struct ListenableFuture<T> {
    shared: Arc<FutureShared<T>>,
}

impl<T> Clone for ListenableFuture<T> {
    fn clone(&self) -> Self {
        ListenableFuture {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> ListenableFuture<T> {
    pub fn is_done(&self) -> bool {
        matches!(*self.shared.state.lock(), FutureState::Complete(_))
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::Acquire)
    }

    /// Flags the task canceled if it has not completed yet. Does not
    /// interrupt a body that is already running; a canceled-but-running body
    /// finishes, and the future stays canceled.
    pub fn cancel(&self) -> bool {
        self.shared.complete(Err(FutureError::Canceled), true)
    }

    /// Blocks until the task completes.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while matches!(*state, FutureState::Pending) {
            self.shared.done.wait(&mut state);
        }
    }

    /// Blocks up to `timeout`; returns whether the task completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while matches!(*state, FutureState::Pending) {
            if self.shared.done.wait_until(&mut state, deadline).timed_out() {
                return matches!(*state, FutureState::Complete(_));
            }
        }
        true
    }

    /// The outcome, if complete.
    pub fn result(&self) -> Option<Result<T, FutureError>> {
        match &*self.shared.state.lock() {
            FutureState::Pending => None,
            FutureState::Complete(outcome) => Some(outcome.clone()),
        }
    }

    pub fn add_listener(&self, listener: Job) {
        self.shared.listeners.add_listener(listener);
    }

    pub fn add_listener_via(&self, listener: Job, executor: Arc<dyn JobExecutor>) {
        self.shared.listeners.add_listener_via(listener, Some(executor));
    }
}

/// Queue-side face of a future: type-erased so task envelopes can hold any
/// result type.
pub(crate) trait FutureWork: Send + Sync {
    fn run(&self);
    fn cancel(&self);
    fn inner_job(&self) -> Job;
}

/// The runnable the scheduler queues for `submit*`: executes the job under a
/// panic guard and completes the paired future exactly once.
pub(crate) struct FutureTask<T> {
    job: Job,
    result_value: Mutex<Option<T>>,
    shared: Arc<FutureShared<T>>,
}

impl<T: Clone + Send + 'static> FutureTask<T> {
    pub fn new(job: Job, result: T) -> Arc<Self> {
        Arc::new(FutureTask {
            job,
            result_value: Mutex::new(Some(result)),
            shared: FutureShared::new(),
        })
    }

    pub fn future(&self) -> ListenableFuture<T> {
        ListenableFuture {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> FutureWork for FutureTask<T> {
    fn run(&self) {
        if self.shared.canceled.load(Ordering::Acquire) {
            return;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| self.job.call())) {
            Ok(()) => {
                if let Some(value) = self.result_value.lock().take() {
                    self.shared.complete(Ok(value), false);
                }
            }
            Err(payload) => {
                // The failure lives in the future; it does not reach the
                // worker's uncaught hook.
                let message = panic_message(payload.as_ref());
                self.shared.complete(Err(FutureError::Panicked(message)), false);
            }
        }
    }

    fn cancel(&self) {
        self.shared.complete(Err(FutureError::Canceled), true);
    }

    fn inner_job(&self) -> Job {
        self.job.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = counter.clone();
        Job::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn once_helper_runs_registered_listeners_once() {
        let helper = ListenerHelper::new(true);
        let count = Arc::new(AtomicUsize::new(0));
        helper.add_listener(counting_job(&count));
        assert_eq!(helper.registered_listener_count(), 1);
        helper.call_listeners();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(helper.registered_listener_count(), 0);
    }

    #[test]
    #[should_panic(expected = "already called")]
    fn once_helper_refuses_second_call() {
        let helper = ListenerHelper::new(true);
        helper.call_listeners();
        helper.call_listeners();
    }

    #[test]
    fn repeated_helper_keeps_listeners_between_calls() {
        let helper = ListenerHelper::new(false);
        let count = Arc::new(AtomicUsize::new(0));
        helper.add_listener(counting_job(&count));
        helper.call_listeners();
        helper.call_listeners();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(helper.registered_listener_count(), 1);
    }

    #[test]
    fn add_after_call_fires_immediately_only_for_once_helper() {
        let once = ListenerHelper::new(true);
        let repeated = ListenerHelper::new(false);
        once.call_listeners();
        repeated.call_listeners();

        let once_count = Arc::new(AtomicUsize::new(0));
        let repeated_count = Arc::new(AtomicUsize::new(0));
        once.add_listener(counting_job(&once_count));
        repeated.add_listener(counting_job(&repeated_count));

        assert_eq!(once_count.load(Ordering::SeqCst), 1);
        assert_eq!(repeated_count.load(Ordering::SeqCst), 0);

        repeated.call_listeners();
        assert_eq!(repeated_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_listener_matches_identity() {
        let helper = ListenerHelper::new(false);
        let count = Arc::new(AtomicUsize::new(0));
        let listener = counting_job(&count);
        let other = counting_job(&count);
        helper.add_listener(listener.clone());
        assert!(!helper.remove_listener(&other));
        assert!(helper.remove_listener(&listener));
        assert!(!helper.remove_listener(&listener));
        helper.call_listeners();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_drops_all_listeners() {
        let helper = ListenerHelper::new(false);
        let count = Arc::new(AtomicUsize::new(0));
        helper.add_listener(counting_job(&count));
        helper.add_listener(counting_job(&count));
        helper.clear_listeners();
        helper.call_listeners();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_added_during_call_runs_next_pass() {
        let helper = Arc::new(ListenerHelper::new(false));
        let late_count = Arc::new(AtomicUsize::new(0));
        let late = counting_job(&late_count);
        let helper_clone = helper.clone();
        let late_clone = late.clone();
        helper.add_listener(Job::new(move || {
            helper_clone.add_listener(late_clone.clone());
        }));

        helper.call_listeners();
        assert_eq!(late_count.load(Ordering::SeqCst), 0);
        helper.call_listeners();
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_removed_by_earlier_listener_still_runs_that_pass() {
        let helper = Arc::new(ListenerHelper::new(false));
        let count = Arc::new(AtomicUsize::new(0));
        let removed = counting_job(&count);
        let helper_clone = helper.clone();
        let removed_clone = removed.clone();
        helper.add_listener(Job::new(move || {
            helper_clone.remove_listener(&removed_clone);
        }));
        helper.add_listener(removed.clone());

        helper.call_listeners();
        helper.call_listeners();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn future_task_completes_with_preset_result() {
        let task = FutureTask::new(Job::new(|| {}), 42u32);
        let future = task.future();
        assert!(!future.is_done());
        task.run();
        assert!(future.is_done());
        assert_eq!(future.result(), Some(Ok(42)));
    }

    #[test]
    fn future_task_captures_panics() {
        let task = FutureTask::new(Job::new(|| panic!("kaboom")), ());
        let future = task.future();
        task.run();
        assert_eq!(
            future.result(),
            Some(Err(FutureError::Panicked("kaboom".to_string())))
        );
    }

    #[test]
    fn canceled_future_skips_the_body() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = FutureTask::new(counting_job(&count), ());
        let future = task.future();
        assert!(future.cancel());
        task.run();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(future.is_canceled());
        assert_eq!(future.result(), Some(Err(FutureError::Canceled)));
        assert!(!future.cancel());
    }

    #[test]
    fn listeners_fire_on_completion_and_after() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = FutureTask::new(Job::new(|| {}), ());
        let future = task.future();
        future.add_listener(counting_job(&count));
        task.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        future.add_listener(counting_job(&count));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_timeout_reports_completion() {
        let task = FutureTask::new(Job::new(|| {}), ());
        let future = task.future();
        assert!(!future.wait_timeout(Duration::from_millis(20)));
        task.run();
        assert!(future.wait_timeout(Duration::from_millis(20)));
        future.wait();
    }
}
