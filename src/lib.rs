//! # taskmill
//!
//! An elastic thread pool for one-shot and recurring tasks tagged with one of
//! two priority classes, plus a key-affinity distributor layered on top.
//!
//! Unlike a fixed-size pool, the [`PriorityScheduler`] grows from its core
//! size up to a maximum under demand and shrinks back as workers sit idle.
//! High priority tasks behave like a conventional pool: they get a thread as
//! soon as one can exist. Low priority tasks prefer reusing warm workers over
//! spawning new threads, waiting a bounded time for one to free up; a small
//! wait-tolerance rule keeps them from being starved by a steady high
//! priority stream.
//!
//! The [`KeyDistributor`] guarantees that tasks sharing a key run serially,
//! in submission order, on a single worker thread while the key's chain is
//! active, without pinning a thread per key.
//!
//! ```no_run
//! use std::time::Duration;
//! use taskmill::{Job, Priority, PriorityScheduler};
//!
//! let pool = PriorityScheduler::new(2, 8, Duration::from_secs(10)).unwrap();
//! pool.execute(Job::new(|| println!("hello from the pool"))).unwrap();
//! pool.schedule_with_priority(
//!     Job::new(|| println!("cleanup")),
//!     Duration::from_millis(250),
//!     Priority::Low,
//! ).unwrap();
//! pool.shutdown();
//! ```

mod clock;
mod config;
mod consumer;
mod delay_queue;
mod distributor;
mod error;
mod future;
mod priority;
mod scheduler;
mod task;
mod threading;
mod worker;

pub use config::{DefaultThreadFactory, SchedulerBuilder, SchedulerConfig, ThreadFactory};
pub use distributor::{KeyDistributor, KeyScheduler};
pub use error::{set_uncaught_panic_handler, TaskError, UncaughtPanicHandler};
pub use future::{FutureError, JobExecutor, ListenableFuture, ListenerHelper};
pub use priority::Priority;
pub use scheduler::PriorityScheduler;
pub use task::Job;
