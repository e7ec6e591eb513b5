use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use taskmill::{Job, KeyDistributor, Priority, PriorityScheduler};

fn bench_scheduler_submission(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_scheduler");

    group.bench_function("execute_high", |b| {
        let scheduler = PriorityScheduler::new(2, 4, Duration::from_secs(10)).unwrap();
        scheduler.prestart_all_core_threads();
        b.iter(|| {
            scheduler
                .execute_with_priority(black_box(Job::new(|| {})), Priority::High)
                .unwrap();
        });
        scheduler.shutdown_now();
    });

    group.bench_function("schedule_delayed", |b| {
        let scheduler = PriorityScheduler::new(2, 4, Duration::from_secs(10)).unwrap();
        b.iter(|| {
            scheduler
                .schedule(black_box(Job::new(|| {})), Duration::from_secs(60))
                .unwrap();
        });
        scheduler.shutdown_now();
    });

    group.finish();
}

fn bench_distributor_submission(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_distributor");

    group.bench_function("execute_single_key", |b| {
        let scheduler = PriorityScheduler::new(2, 4, Duration::from_secs(10)).unwrap();
        let distributor = KeyDistributor::new(scheduler, 16).unwrap();
        b.iter(|| {
            distributor
                .execute(black_box("hot-key"), Job::new(|| {}))
                .unwrap();
        });
        distributor.scheduler().shutdown_now();
    });

    group.finish();
}

criterion_group!(benches, bench_scheduler_submission, bench_distributor_submission);
criterion_main!(benches);
