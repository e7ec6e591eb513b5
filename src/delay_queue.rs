//! Delay-ordered queue tolerating items whose delay changes while queued.
//!
//! Recurring task envelopes report an unreachable delay while their body
//! runs and a real one once re-armed, so the queue must support re-sorting a
//! single known element (`reposition`) and parking an element at the tail
//! without comparisons (`add_last`). All mutation happens under one lock; a
//! condition variable wakes the blocked consumer when the head may have
//! changed.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Cap on a single timed wait; waiters re-check the head after each chunk.
const MAX_WAIT_CHUNK_MS: u64 = 60 * 60 * 1000;

/// An item with a time-varying remaining delay and a stable identity.
pub(crate) trait Delayed {
    /// Remaining delay in milliseconds; due when `<= 0`.
    fn delay_ms(&self) -> i64;

    /// Identity comparison, independent of the delay value.
    fn same_item(&self, other: &Self) -> bool;
}

/// Mutable delay-ordered queue with blocking head removal.
pub(crate) struct DelayQueue<T: Delayed + Clone> {
    inner: Mutex<VecDeque<T>>,
    signal: Condvar,
    len: AtomicUsize,
}

impl<T: Delayed + Clone> DelayQueue<T> {
    pub fn new() -> Self {
        DelayQueue {
            inner: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Ordered insert by the item's current delay; stable for equal delays
    /// (lands after existing equals).
    ///
    /// Callers freeze the clock around the call so every comparison in one
    /// insert reads the same instant.
    pub fn add(&self, item: T) {
        let delay = item.delay_ms();
        let mut queue = self.inner.lock();
        let position = queue.partition_point(|existing| existing.delay_ms() <= delay);
        queue.insert(position, item);
        self.len.fetch_add(1, Ordering::Relaxed);
        self.signal.notify_one();
    }

    /// Append without comparing; used to park a re-executing recurring item
    /// whose reported delay is unreachable anyway.
    pub fn add_last(&self, item: T) {
        let mut queue = self.inner.lock();
        queue.push_back(item);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Blocks until the head item is due, then pops and returns it.
    ///
    /// `on_dequeue` runs while the queue lock is still held; when it returns
    /// true the popped item is also parked back at the tail in the same lock
    /// acquisition (recurring items entering execution). Returns `None` once
    /// `stopped` is observed.
    pub fn take(&self, stopped: &AtomicBool, on_dequeue: impl Fn(&T) -> bool) -> Option<T> {
        let mut queue = self.inner.lock();
        loop {
            if stopped.load(Ordering::Acquire) {
                return None;
            }
            match queue.front() {
                Some(head) => {
                    let delay = head.delay_ms();
                    if delay <= 0 {
                        let item = queue.pop_front().expect("head checked above");
                        if on_dequeue(&item) {
                            queue.push_back(item.clone());
                        } else {
                            self.len.fetch_sub(1, Ordering::Relaxed);
                        }
                        return Some(item);
                    }
                    let wait = Duration::from_millis((delay as u64).min(MAX_WAIT_CHUNK_MS));
                    self.signal.wait_for(&mut queue, wait);
                }
                None => {
                    self.signal.wait(&mut queue);
                }
            }
        }
    }

    /// Re-sorts one known element after its delay changed.
    ///
    /// The element is located by identity, removed, and only then is
    /// `updater` invoked (still under the lock) so the item can mutate its
    /// delay field without a racing comparator read. Placement uses the
    /// caller-supplied delay, which may differ from the raw value (the low
    /// priority path clamps negatives to zero). Returns whether the element
    /// was found.
    pub fn reposition(&self, target: &T, placement_delay_ms: i64, updater: impl FnOnce()) -> bool {
        let mut queue = self.inner.lock();
        let Some(index) = queue.iter().position(|item| item.same_item(target)) else {
            return false;
        };
        let item = queue.remove(index).expect("index located above");
        updater();
        let position = queue.partition_point(|existing| existing.delay_ms() <= placement_delay_ms);
        queue.insert(position, item);
        self.signal.notify_one();
        true
    }

    /// Removes and returns the first item matching the predicate.
    pub fn remove_where(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let mut queue = self.inner.lock();
        let index = queue.iter().position(|item| predicate(item))?;
        let item = queue.remove(index).expect("index located above");
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(item)
    }

    /// Empties the queue, returning everything in queue order.
    pub fn drain(&self) -> Vec<T> {
        let mut queue = self.inner.lock();
        self.len.store(0, Ordering::Relaxed);
        queue.drain(..).collect()
    }

    /// Lock-free length; safe to read while holding unrelated locks.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes any blocked [`take`](Self::take); pairs with raising `stopped`.
    pub fn wake_all(&self) {
        let _queue = self.inner.lock();
        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[derive(Clone)]
    struct TestItem {
        id: usize,
        delay: Arc<AtomicI64>,
    }

    impl TestItem {
        fn new(id: usize, delay: i64) -> Self {
            TestItem {
                id,
                delay: Arc::new(AtomicI64::new(delay)),
            }
        }
    }

    impl Delayed for TestItem {
        fn delay_ms(&self) -> i64 {
            self.delay.load(Ordering::Relaxed)
        }

        fn same_item(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.delay, &other.delay)
        }
    }

    #[test]
    fn add_keeps_delay_order() {
        let queue = DelayQueue::new();
        queue.add(TestItem::new(1, 30));
        queue.add(TestItem::new(2, 10));
        queue.add(TestItem::new(3, 20));
        let order: Vec<usize> = queue.drain().into_iter().map(|i| i.id).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn equal_delays_preserve_insertion_order() {
        let queue = DelayQueue::new();
        for id in 0..5 {
            queue.add(TestItem::new(id, 10));
        }
        let order: Vec<usize> = queue.drain().into_iter().map(|i| i.id).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn take_blocks_until_head_is_due() {
        let queue = Arc::new(DelayQueue::new());
        queue.add(TestItem::new(7, 60));
        let stopped = Arc::new(AtomicBool::new(false));
        let started = Instant::now();
        let item = queue.take(&stopped, |_| false).unwrap();
        assert_eq!(item.id, 7);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn take_returns_none_when_stopped() {
        let queue: Arc<DelayQueue<TestItem>> = Arc::new(DelayQueue::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = {
            let queue = queue.clone();
            let stopped = stopped.clone();
            thread::spawn(move || queue.take(&stopped, |_| false))
        };
        thread::sleep(Duration::from_millis(30));
        stopped.store(true, Ordering::Release);
        queue.wake_all();
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn dequeue_hook_can_park_item_at_tail() {
        let queue = DelayQueue::new();
        let recurring = TestItem::new(1, 0);
        queue.add(recurring.clone());
        queue.add(TestItem::new(2, 5));
        let stopped = AtomicBool::new(false);
        let taken = queue
            .take(&stopped, |item| {
                item.delay.store(i64::MAX, Ordering::Relaxed);
                true
            })
            .unwrap();
        assert_eq!(taken.id, 1);
        // Item 1 is parked at the back with an unreachable delay.
        assert_eq!(queue.len(), 2);
        let order: Vec<usize> = queue.drain().into_iter().map(|i| i.id).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn reposition_moves_item_after_updater_runs() {
        let queue = DelayQueue::new();
        let parked = TestItem::new(1, i64::MAX);
        queue.add(TestItem::new(2, 50));
        queue.add_last(parked.clone());
        let found = queue.reposition(&parked, 10, || {
            parked.delay.store(10, Ordering::Relaxed);
        });
        assert!(found);
        let order: Vec<usize> = queue.drain().into_iter().map(|i| i.id).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn reposition_misses_absent_items() {
        let queue = DelayQueue::new();
        queue.add(TestItem::new(2, 50));
        let ghost = TestItem::new(9, 0);
        assert!(!queue.reposition(&ghost, 0, || {}));
    }

    #[test]
    fn remove_where_takes_first_match_only() {
        let queue = DelayQueue::new();
        queue.add(TestItem::new(1, 10));
        queue.add(TestItem::new(2, 20));
        queue.add(TestItem::new(3, 30));
        let removed = queue.remove_where(|item| item.id >= 2).unwrap();
        assert_eq!(removed.id, 2);
        assert_eq!(queue.len(), 2);
        assert!(queue.remove_where(|item| item.id == 2).is_none());
    }

    #[test]
    fn added_item_wakes_a_blocked_take() {
        let queue: Arc<DelayQueue<TestItem>> = Arc::new(DelayQueue::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = {
            let queue = queue.clone();
            let stopped = stopped.clone();
            thread::spawn(move || queue.take(&stopped, |_| false))
        };
        thread::sleep(Duration::from_millis(20));
        queue.add(TestItem::new(4, 0));
        let item = handle.join().unwrap().unwrap();
        assert_eq!(item.id, 4);
    }
}
