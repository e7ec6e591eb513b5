//! Per-priority queue consumer thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ThreadFactory;

/// Long-lived thread draining one priority's delay queue into the pool's
/// dispatch path.
///
/// Start is lazy: nothing is spawned until the first task lands in the
/// queue. Stop is one-way; a stopped consumer cannot be restarted.
pub(crate) struct TaskConsumer {
    name: String,
    started: AtomicBool,
    stopped: Arc<AtomicBool>,
}

impl TaskConsumer {
    pub fn new(name: impl Into<String>) -> Self {
        TaskConsumer {
            name: name.into(),
            started: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the consumer loop polls through the queue's blocking take.
    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    /// Spawns the consumer thread on first call; later calls are no-ops.
    ///
    /// `body` is the consume loop; it receives nothing and owns its captured
    /// state. A failed spawn rewinds the started flag so a later submission
    /// retries.
    pub fn start_if_not_started(
        &self,
        factory: &dyn ThreadFactory,
        body: impl FnOnce() + Send + 'static,
    ) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(consumer = %self.name, "starting queue consumer");
            if let Err(error) = factory.spawn(self.name.clone(), Box::new(body)) {
                tracing::error!(consumer = %self.name, %error, "failed to spawn consumer");
                self.started.store(false, Ordering::Release);
            }
        }
    }

    /// One-way stop. Returns whether this call performed the transition.
    /// The caller is responsible for waking the queue the loop blocks on.
    pub fn stop_if_running(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }
}
