use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use taskmill::{Job, KeyDistributor, PriorityScheduler, TaskError};

fn pool(core: usize, max: usize) -> PriorityScheduler {
    PriorityScheduler::new(core, max, Duration::from_secs(10)).unwrap()
}

/// Tracks, per key, that runs never overlap and stay on one thread.
#[derive(Default)]
struct KeyObserver {
    running: AtomicUsize,
    overlaps: AtomicUsize,
    threads: Mutex<Vec<ThreadId>>,
}

impl KeyObserver {
    fn enter(&self) {
        if self.running.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.threads.lock().push(thread::current().id());
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn thread_consistent(&self) -> bool {
        let threads = self.threads.lock();
        threads.windows(2).all(|pair| pair[0] == pair[1])
    }
}

#[test]
fn interleaved_keys_keep_per_key_fifo_and_exclusivity() {
    let scheduler = pool(2, 4);
    let distributor = KeyDistributor::new(scheduler, 4).unwrap();
    let (tx, rx) = unbounded();
    let observers: HashMap<&str, Arc<KeyObserver>> = [("A", Arc::default()), ("B", Arc::default())]
        .into_iter()
        .collect();

    for index in 0..100 {
        for key in ["A", "B"] {
            let tx = tx.clone();
            let observer = observers[key].clone();
            distributor
                .execute(
                    key,
                    Job::new(move || {
                        observer.enter();
                        tx.send((key, index)).unwrap();
                        observer.exit();
                    }),
                )
                .unwrap();
        }
    }
    drop(tx);

    let mut seen: HashMap<&str, Vec<usize>> = HashMap::new();
    for _ in 0..200 {
        let (key, index) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        seen.entry(key).or_default().push(index);
    }
    for key in ["A", "B"] {
        assert_eq!(seen[key], (0..100).collect::<Vec<_>>(), "order broke for {key}");
        assert_eq!(
            observers[key].overlaps.load(Ordering::SeqCst),
            0,
            "concurrent execution observed for {key}"
        );
    }
    distributor.scheduler().shutdown_now();
}

#[test]
fn an_uninterrupted_chain_stays_on_one_thread() {
    let scheduler = pool(2, 4);
    let distributor = KeyDistributor::new(scheduler, 4).unwrap();
    let observer = Arc::new(KeyObserver::default());
    let remaining = Arc::new(AtomicUsize::new(50));

    // The chain's first task sleeps long enough for every later submission
    // to land in the same chain, so one drain task runs them all.
    distributor
        .execute("key", Job::new(|| thread::sleep(Duration::from_millis(50))))
        .unwrap();
    for _ in 0..50 {
        let observer = observer.clone();
        let remaining = remaining.clone();
        distributor
            .execute(
                "key",
                Job::new(move || {
                    observer.enter();
                    observer.exit();
                    remaining.fetch_sub(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while remaining.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(remaining.load(Ordering::SeqCst), 0);
    assert!(observer.thread_consistent(), "chain hopped threads");
    distributor.scheduler().shutdown_now();
}

#[test]
fn distinct_keys_run_concurrently() {
    let scheduler = pool(2, 4);
    let distributor = KeyDistributor::new(scheduler, 4).unwrap();
    let (tx, rx) = unbounded();
    for key in ["A", "B"] {
        let tx = tx.clone();
        distributor
            .execute(
                key,
                Job::new(move || {
                    tx.send((key, Instant::now())).unwrap();
                    thread::sleep(Duration::from_millis(80));
                }),
            )
            .unwrap();
    }
    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let gap = second.1.duration_since(first.1);
    assert!(
        gap < Duration::from_millis(60),
        "keys should overlap, started {gap:?} apart"
    );
    distributor.scheduler().shutdown_now();
}

#[test]
fn scheduled_key_task_honors_the_delay() {
    let scheduler = pool(1, 2);
    let distributor = KeyDistributor::new(scheduler, 2).unwrap();
    let (tx, rx) = unbounded();
    let submit_time = Instant::now();
    distributor
        .schedule(
            "key",
            Job::new(move || {
                tx.send(Instant::now()).unwrap();
            }),
            Duration::from_millis(100),
        )
        .unwrap();
    let started = rx
        .recv_timeout(Duration::from_secs(2))
        .unwrap()
        .duration_since(submit_time);
    assert!(started >= Duration::from_millis(95), "ran early: {started:?}");
    distributor.scheduler().shutdown_now();
}

#[test]
fn recurring_key_task_repeats_serially() {
    let scheduler = pool(1, 2);
    let distributor = KeyDistributor::new(scheduler, 2).unwrap();
    let observer = Arc::new(KeyObserver::default());
    let count = Arc::new(AtomicUsize::new(0));
    {
        let observer = observer.clone();
        let count = count.clone();
        distributor
            .schedule_with_fixed_delay(
                "key",
                Job::new(move || {
                    observer.enter();
                    count.fetch_add(1, Ordering::SeqCst);
                    observer.exit();
                }),
                Duration::ZERO,
                Duration::from_millis(40),
            )
            .unwrap();
    }
    thread::sleep(Duration::from_millis(500));
    distributor.scheduler().shutdown_now();
    let runs = count.load(Ordering::SeqCst);
    assert!(runs >= 5, "only {runs} recurring runs");
    assert_eq!(observer.overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn key_scheduler_facade_binds_its_key() {
    let scheduler = pool(1, 2);
    let distributor = KeyDistributor::new(scheduler, 2).unwrap();
    let facade = distributor.scheduler_for_key("bound");
    let (tx, rx) = unbounded();
    facade
        .execute(Job::new(move || {
            tx.send(()).unwrap();
        }))
        .unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    assert!(!facade.is_shutdown());
    distributor.scheduler().shutdown();
    assert!(facade.is_shutdown());
}

#[test]
fn panicking_chain_task_does_not_stall_the_key() {
    let scheduler = pool(1, 2);
    let distributor = KeyDistributor::new(scheduler, 2).unwrap();
    let (tx, rx) = unbounded();
    distributor
        .execute("key", Job::new(|| panic!("first task fails")))
        .unwrap();
    distributor
        .execute(
            "key",
            Job::new(move || {
                tx.send(()).unwrap();
            }),
        )
        .unwrap();
    // The second task still runs even though the first panicked.
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    distributor.scheduler().shutdown_now();
}
