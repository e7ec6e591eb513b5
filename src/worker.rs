//! Pool worker: one OS thread, one task at a time, parked in between.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::config::ThreadFactory;
use crate::error::forward_panic;
use crate::task::TaskRef;

/// The slice of the pool a worker is allowed to call back into.
///
/// Workers hold this instead of the whole scheduler so the worker↔pool cycle
/// stays a narrow, explicit seam.
pub(crate) trait WorkerHost: Send + Sync {
    /// Execute one task envelope on the calling (worker) thread.
    fn run_task(&self, task: &TaskRef);

    /// Return an idle worker to the pool after it finished a task.
    fn worker_done(&self, worker: Arc<Worker>);

    /// Cached monotonic milliseconds, for the idle-since stamp.
    fn now_ms(&self) -> u64;
}

/// A single pool thread. Receives assignments through a slot write plus
/// unpark; parks while idle; runs a pending assignment even if stopped during
/// the hand-off (an accepted task is never dropped).
pub(crate) struct Worker {
    thread: Mutex<Option<Thread>>,
    slot: Mutex<Option<TaskRef>>,
    running: AtomicBool,
    last_run_ms: AtomicU64,
}

impl Worker {
    pub fn new(now_ms: u64) -> Arc<Self> {
        Arc::new(Worker {
            thread: Mutex::new(None),
            slot: Mutex::new(None),
            running: AtomicBool::new(true),
            last_run_ms: AtomicU64::new(now_ms),
        })
    }

    /// Spawns the worker's thread via the pool's factory.
    ///
    /// The thread handle is stored before this returns, so an assignment can
    /// follow immediately.
    pub fn start(
        self: &Arc<Self>,
        host: Arc<dyn WorkerHost>,
        factory: &dyn ThreadFactory,
        name: String,
    ) -> std::io::Result<()> {
        let worker = self.clone();
        let handle = factory.spawn(name, Box::new(move || worker.run_loop(host)))?;
        *self.thread.lock() = Some(handle.thread().clone());
        Ok(())
    }

    /// Supplies the next task. The worker must be idle; there is no queueing
    /// inside a worker.
    pub fn assign(&self, task: TaskRef) {
        *self.slot.lock() = Some(task);
        self.unpark();
    }

    /// One-way stop. Returns whether this call performed the transition, so
    /// the pool decrements its size exactly once per worker.
    pub fn stop(&self) -> bool {
        let stopped = self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if stopped {
            self.unpark();
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// When this worker last finished a task; drives keep-alive expiry.
    pub fn last_run_ms(&self) -> u64 {
        self.last_run_ms.load(Ordering::Acquire)
    }

    fn unpark(&self) {
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.unpark();
        }
    }

    fn run_loop(self: Arc<Self>, host: Arc<dyn WorkerHost>) {
        tracing::debug!("worker thread started");
        loop {
            let task = self.await_assignment();
            if let Some(task) = task {
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| host.run_task(&task)))
                {
                    forward_panic(payload);
                }
            }
            if self.is_running() {
                self.last_run_ms.store(host.now_ms(), Ordering::Release);
                host.worker_done(self.clone());
            } else {
                break;
            }
        }
        tracing::debug!("worker thread exiting");
    }

    /// Parks until a task lands in the slot or the worker is stopped.
    ///
    /// The slot is checked before the stop flag so a task handed off just
    /// before a stop still runs.
    fn await_assignment(&self) -> Option<TaskRef> {
        loop {
            if let Some(task) = self.slot.lock().take() {
                return Some(task);
            }
            if !self.is_running() {
                return None;
            }
            thread::park();
        }
    }
}
