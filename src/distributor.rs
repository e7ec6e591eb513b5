//! Per-key serial execution layered on the scheduler.
//!
//! Tasks sharing a key run one at a time, in submission order, and stay on a
//! single worker thread while the key's chain is active. No thread is pinned
//! per key: an idle chain costs nothing, and an active chain is exactly one
//! scheduler task draining its queue.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{run_job_guarded, TaskError};
use crate::future::JobExecutor;
use crate::scheduler::PriorityScheduler;
use crate::task::Job;

/// Pending work for one key: the backlog plus whether a drain task is
/// already out on the scheduler.
struct TaskChain {
    active: bool,
    pending: VecDeque<Job>,
}

struct DistributorInner<K> {
    scheduler: PriorityScheduler,
    /// Each stripe's lock guards that stripe's slice of the key space.
    stripes: Vec<Mutex<HashMap<K, TaskChain>>>,
}

impl<K> DistributorInner<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn stripe(&self, key: &K) -> &Mutex<HashMap<K, TaskChain>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[index]
    }

    fn add_task(self: &Arc<Self>, key: K, job: Job) -> Result<(), TaskError> {
        if self.scheduler.is_shutdown() {
            return Err(TaskError::Rejected);
        }
        let dispatch = {
            let mut map = self.stripe(&key).lock();
            let chain = map.entry(key.clone()).or_insert_with(|| TaskChain {
                active: false,
                pending: VecDeque::new(),
            });
            chain.pending.push_back(job);
            if chain.active {
                false
            } else {
                chain.active = true;
                true
            }
        };
        if dispatch {
            let inner = self.clone();
            let drain_key = key.clone();
            let drain = Job::new(move || inner.drain_chain(&drain_key));
            if let Err(error) = self.scheduler.execute(drain) {
                // Roll the flag back so a rejected dispatch cannot wedge the
                // key forever.
                let mut map = self.stripe(&key).lock();
                if let Some(chain) = map.get_mut(&key) {
                    chain.active = false;
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Body of the single drain task for a key: pop under the stripe lock,
    /// run outside it, repeat; deactivate and drop the entry once empty.
    fn drain_chain(&self, key: &K) {
        loop {
            let next = {
                let mut map = self.stripe(key).lock();
                let Some(chain) = map.get_mut(key) else {
                    break;
                };
                match chain.pending.pop_front() {
                    Some(job) => Some(job),
                    None => {
                        chain.active = false;
                        if chain.pending.is_empty() {
                            map.remove(key);
                        }
                        None
                    }
                }
            };
            match next {
                // A panicking job is reported and the chain keeps draining.
                Some(job) => run_job_guarded(&job),
                None => break,
            }
        }
    }
}

/// Distributes tasks across a pool while serializing all tasks that share a
/// key.
///
/// Guarantees per key: FIFO submission order, no concurrent execution, and a
/// single worker thread for as long as the key's chain stays non-empty.
/// Distinct keys run concurrently, bounded only by the underlying pool.
pub struct KeyDistributor<K> {
    inner: Arc<DistributorInner<K>>,
}

impl<K> Clone for KeyDistributor<K> {
    fn clone(&self) -> Self {
        KeyDistributor {
            inner: self.inner.clone(),
        }
    }
}

impl<K> KeyDistributor<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    /// `stripe_count` fixes the lock striping for the life of the
    /// distributor; one stripe degenerates to a global serial order of chain
    /// bookkeeping (keys still run concurrently with each other).
    pub fn new(scheduler: PriorityScheduler, stripe_count: usize) -> Result<Self, TaskError> {
        if stripe_count == 0 {
            return Err(TaskError::InvalidArgument("stripe_count must be at least one"));
        }
        let stripes = (0..stripe_count).map(|_| Mutex::new(HashMap::new())).collect();
        Ok(KeyDistributor {
            inner: Arc::new(DistributorInner { scheduler, stripes }),
        })
    }

    /// The pool this distributor dispatches onto.
    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.inner.scheduler
    }

    /// Appends `job` to the key's chain, to run as soon as everything ahead
    /// of it on that key has finished.
    pub fn execute(&self, key: K, job: Job) -> Result<(), TaskError> {
        self.inner.add_task(key, job)
    }

    /// Appends to the key's chain after `delay`. The delay covers the
    /// enqueue; same-key tasks submitted in the meantime run first.
    pub fn schedule(&self, key: K, job: Job, delay: Duration) -> Result<(), TaskError> {
        let inner = self.inner.clone();
        let enqueue = Job::new(move || {
            if let Err(error) = inner.add_task(key.clone(), job.clone()) {
                tracing::debug!(%error, "delayed key enqueue dropped");
            }
        });
        self.inner.scheduler.schedule(enqueue, delay)
    }

    /// Repeatedly appends to the key's chain: first after `initial_delay`,
    /// then `recurring_delay` after each enqueue. Each enqueued run still
    /// honors the key's FIFO and exclusivity guarantees.
    pub fn schedule_with_fixed_delay(
        &self,
        key: K,
        job: Job,
        initial_delay: Duration,
        recurring_delay: Duration,
    ) -> Result<(), TaskError> {
        let inner = self.inner.clone();
        let enqueue = Job::new(move || {
            if let Err(error) = inner.add_task(key.clone(), job.clone()) {
                tracing::debug!(%error, "recurring key enqueue dropped");
            }
        });
        self.inner
            .scheduler
            .schedule_with_fixed_delay(enqueue, initial_delay, recurring_delay)
    }

    /// A façade with the key pre-bound, usable anywhere a serial executor is
    /// expected.
    pub fn scheduler_for_key(&self, key: K) -> KeyScheduler<K> {
        KeyScheduler {
            distributor: self.clone(),
            key,
        }
    }
}

/// Single-key view of a [`KeyDistributor`]; every submission goes to the
/// bound key's chain.
pub struct KeyScheduler<K> {
    distributor: KeyDistributor<K>,
    key: K,
}

impl<K> KeyScheduler<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn execute(&self, job: Job) -> Result<(), TaskError> {
        self.distributor.execute(self.key.clone(), job)
    }

    pub fn schedule(&self, job: Job, delay: Duration) -> Result<(), TaskError> {
        self.distributor.schedule(self.key.clone(), job, delay)
    }

    pub fn schedule_with_fixed_delay(
        &self,
        job: Job,
        initial_delay: Duration,
        recurring_delay: Duration,
    ) -> Result<(), TaskError> {
        self.distributor
            .schedule_with_fixed_delay(self.key.clone(), job, initial_delay, recurring_delay)
    }

    /// Reflects the underlying pool's state.
    pub fn is_shutdown(&self) -> bool {
        self.distributor.scheduler().is_shutdown()
    }
}

impl<K> JobExecutor for KeyScheduler<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn execute_job(&self, job: Job) -> Result<(), TaskError> {
        self.execute(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> PriorityScheduler {
        PriorityScheduler::builder()
            .core_pool_size(1)
            .max_pool_size(4)
            .keep_alive_time(Duration::from_secs(10))
            .default_priority(Priority::High)
            .build()
            .unwrap()
    }

    #[test]
    fn rejects_zero_stripes() {
        let result = KeyDistributor::<String>::new(pool(), 0);
        assert!(matches!(result, Err(TaskError::InvalidArgument(_))));
    }

    #[test]
    fn chain_entry_is_removed_once_drained() {
        let distributor = KeyDistributor::new(pool(), 4).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            distributor
                .execute(
                    "key".to_string(),
                    Job::new(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // The chain map entry is gone once the drain observed it empty.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let empty = distributor
                .inner
                .stripes
                .iter()
                .all(|stripe| stripe.lock().is_empty());
            if empty || std::time::Instant::now() >= deadline {
                assert!(empty);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        distributor.scheduler().shutdown_now();
    }

    #[test]
    fn submissions_after_shutdown_are_rejected() {
        let distributor = KeyDistributor::new(pool(), 2).unwrap();
        distributor.scheduler().shutdown_now();
        let result = distributor.execute("key".to_string(), Job::new(|| {}));
        assert_eq!(result, Err(TaskError::Rejected));
    }
}
