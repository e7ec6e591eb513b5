//! Pool configuration, builder, and OS-thread provisioning.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::TaskError;
use crate::priority::Priority;
use crate::scheduler::PriorityScheduler;
use crate::threading::set_normal_thread_priority;

/// Mints the OS threads backing workers and queue consumers.
///
/// Custom factories can pin cores, adjust scheduling classes, or install
/// per-thread state before handing control to `body`. Threads are detached;
/// the pool never joins them.
pub trait ThreadFactory: Send + Sync {
    fn spawn(
        &self,
        name: String,
        body: Box<dyn FnOnce() + Send>,
    ) -> std::io::Result<JoinHandle<()>>;
}

/// Default factory: named threads at normal OS scheduling priority.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn spawn(
        &self,
        name: String,
        body: Box<dyn FnOnce() + Send>,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new().name(name).spawn(move || {
            set_normal_thread_priority();
            body();
        })
    }
}

/// Plain-data snapshot of the pool tunables.
///
/// Everything here can also be adjusted at runtime through the scheduler's
/// setters; the snapshot exists so deployments can keep pool sizing in
/// configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker count retained even when idle (unless core timeout is allowed).
    pub core_pool_size: usize,
    /// Ceiling the pool may grow to under demand.
    pub max_pool_size: usize,
    /// Idle time after which workers above the core size are expired.
    pub keep_alive_time_ms: u64,
    /// Priority assigned to submissions that do not specify one.
    pub default_priority: Priority,
    /// How long a low priority task waits for a warm worker before the pool
    /// grows for it.
    pub max_wait_for_low_priority_ms: u64,
    /// Whether core workers are also subject to keep-alive expiry.
    pub allow_core_thread_timeout: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            core_pool_size: 1,
            max_pool_size: 1,
            keep_alive_time_ms: 10_000,
            default_priority: Priority::High,
            max_wait_for_low_priority_ms: 500,
            allow_core_thread_timeout: false,
        }
    }
}

/// Builder for [`PriorityScheduler`]; validation happens at [`build`](Self::build).
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    thread_factory: Option<Arc<dyn ThreadFactory>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            thread_factory: None,
        }
    }

    /// Starts from an existing config snapshot.
    pub fn from_config(config: SchedulerConfig) -> Self {
        SchedulerBuilder {
            config,
            thread_factory: None,
        }
    }

    pub fn core_pool_size(mut self, size: usize) -> Self {
        self.config.core_pool_size = size;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.config.max_pool_size = size;
        self
    }

    pub fn keep_alive_time(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive_time_ms = keep_alive.as_millis() as u64;
        self
    }

    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.config.default_priority = priority;
        self
    }

    pub fn max_wait_for_low_priority(mut self, wait: Duration) -> Self {
        self.config.max_wait_for_low_priority_ms = wait.as_millis() as u64;
        self
    }

    pub fn allow_core_thread_timeout(mut self, allow: bool) -> Self {
        self.config.allow_core_thread_timeout = allow;
        self
    }

    pub fn thread_factory(mut self, factory: Arc<dyn ThreadFactory>) -> Self {
        self.thread_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<PriorityScheduler, TaskError> {
        if self.config.core_pool_size == 0 {
            return Err(TaskError::InvalidArgument("core_pool_size must be at least one"));
        }
        if self.config.max_pool_size < self.config.core_pool_size {
            return Err(TaskError::InvalidArgument(
                "max_pool_size must be >= core_pool_size",
            ));
        }
        let factory = self
            .thread_factory
            .unwrap_or_else(|| Arc::new(DefaultThreadFactory));
        Ok(PriorityScheduler::from_parts(self.config, factory))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
