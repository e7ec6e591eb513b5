//! Monotonic millisecond clock with a cached read and a freezable wrapper.
//!
//! The scheduler compares task due-times against "now" constantly; most of
//! those reads tolerate a slightly stale value, so the clock caches the last
//! observed milliseconds and only refreshes on the accurate read. The wrapper
//! adds a hold counter: while any hold guard is alive, the semi-accurate read
//! sticks to the cached value so every comparison inside a single queue
//! insert or reposition sees the same instant.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Forward-progressing millisecond source anchored at construction.
#[derive(Debug)]
pub(crate) struct Clock {
    origin: Instant,
    cached_ms: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            origin: Instant::now(),
            cached_ms: AtomicU64::new(0),
        }
    }

    /// Reads the wall position now and refreshes the cache.
    ///
    /// `fetch_max` keeps the cache monotonic even when several threads race
    /// to refresh it.
    pub fn accurate_millis(&self) -> u64 {
        let now = self.origin.elapsed().as_millis() as u64;
        let prev = self.cached_ms.fetch_max(now, Ordering::Relaxed);
        now.max(prev)
    }

    /// Last cached millisecond value; never issues a syscall.
    pub fn last_known_millis(&self) -> u64 {
        self.cached_ms.load(Ordering::Relaxed)
    }
}

/// [`Clock`] plus a nestable hold that pins the semi-accurate read.
#[derive(Debug)]
pub(crate) struct ClockWrapper {
    clock: Clock,
    holds: AtomicUsize,
}

impl ClockWrapper {
    pub fn new() -> Self {
        ClockWrapper {
            clock: Clock::new(),
            holds: AtomicUsize::new(0),
        }
    }

    pub fn accurate_millis(&self) -> u64 {
        self.clock.accurate_millis()
    }

    pub fn last_known_millis(&self) -> u64 {
        self.clock.last_known_millis()
    }

    /// Cached value while a hold is active, otherwise a refreshing read.
    ///
    /// Delay comparators call this; the hold keeps ordering stable across a
    /// whole insert even if the OS clock ticks mid-operation.
    pub fn semi_accurate_millis(&self) -> u64 {
        if self.holds.load(Ordering::Acquire) > 0 {
            self.clock.last_known_millis()
        } else {
            self.clock.accurate_millis()
        }
    }

    /// Freezes the semi-accurate read until the returned guard drops.
    ///
    /// The cached value is left as-is; dispatch paths refresh it often enough
    /// that it is at most a beat behind. Holds nest.
    pub fn hold(&self) -> ClockHold<'_> {
        self.holds.fetch_add(1, Ordering::AcqRel);
        ClockHold { wrapper: self }
    }
}

/// RAII guard for a clock hold; see [`ClockWrapper::hold`].
pub(crate) struct ClockHold<'a> {
    wrapper: &'a ClockWrapper,
}

impl Drop for ClockHold<'_> {
    fn drop(&mut self) {
        self.wrapper.holds.fetch_sub(1, Ordering::AcqRel);
    }
}
