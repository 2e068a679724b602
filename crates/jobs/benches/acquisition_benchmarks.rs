use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use stepflow_core::{JobId, ManualClock, ProcessInstanceId};
use stepflow_jobs::{
    AcquisitionLoop, AcquisitionOrder, AlwaysAvailable, FnHandler, InMemoryJobStore,
    JobExecutorConfig, JobService, JobStore, NewJob, ReleaseLocks, WorkerDispatcher,
};

fn populated_store(jobs: usize) -> InMemoryJobStore {
    let now = Utc::now();
    let store = InMemoryJobStore::new();
    for i in 0..jobs {
        let job = NewJob::new("bench", json!({ "n": i }))
            .with_priority((i % 7) as i64)
            .into_job(JobId::new(), 3, now);
        store.insert(job).unwrap();
    }
    store
}

/// Query plus conditional lock of one batch, the hot path of every cycle.
fn bench_find_and_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_and_lock");

    for backlog in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(3));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || populated_store(backlog),
                |store| {
                    let now = Utc::now();
                    let candidates = store
                        .find_due_unlocked(now, 3, AcquisitionOrder::Priority)
                        .unwrap();
                    for job in &candidates {
                        black_box(
                            store
                                .try_lock(job.id, "bench", Duration::from_secs(300), now)
                                .unwrap(),
                        );
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Contended locking: every attempt after the first loses.
fn bench_lost_lock(c: &mut Criterion) {
    let store = populated_store(1);
    let now = Utc::now();
    let id = store
        .find_due_unlocked(now, 1, AcquisitionOrder::Priority)
        .unwrap()[0]
        .id;
    store
        .try_lock(id, "winner", Duration::from_secs(3_600), now)
        .unwrap();

    c.bench_function("try_lock_lost", |b| {
        b.iter(|| {
            black_box(
                store
                    .try_lock(black_box(id), "loser", Duration::from_secs(300), now)
                    .unwrap(),
            )
        })
    });
}

/// One full cycle: query, lock, group per process instance and queue batches.
fn bench_acquisition_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquisition_cycle");
    group.sample_size(50);

    for max_jobs in [3usize, 12, 48] {
        group.throughput(Throughput::Elements(max_jobs as u64));
        let clock = ManualClock::new(Utc::now());
        let config = JobExecutorConfig {
            queue_capacity: 1_024,
            ..JobExecutorConfig::default()
        }
        .with_max_jobs_per_acquisition(max_jobs);
        let dispatcher = Arc::new(
            WorkerDispatcher::new(
                "bench",
                config.core_pool_size,
                config.queue_capacity,
                Arc::new(AlwaysAvailable),
                Arc::new(ReleaseLocks),
            )
            .unwrap(),
        );

        group.bench_with_input(BenchmarkId::from_parameter(max_jobs), &max_jobs, |b, &max_jobs| {
            b.iter_batched(
                || {
                    let service = JobService::new(
                        "bench",
                        InMemoryJobStore::arc(),
                        Arc::new(clock.clone()),
                        &config,
                    );
                    service.register_handler(Arc::new(FnHandler::new("bench", |_| Ok(()))));
                    for i in 0..max_jobs {
                        let pi = ProcessInstanceId::new();
                        let mut job = NewJob::new("bench", json!({}));
                        if i % 2 == 0 {
                            job = job.for_execution(pi.root_execution_id(), pi);
                        }
                        service.create_job(job).unwrap();
                    }
                    AcquisitionLoop::new(&config, vec![Arc::new(service)], dispatcher.clone())
                        .unwrap()
                },
                |mut acquisition| black_box(acquisition.run_cycle()),
                BatchSize::SmallInput,
            );
        });
        dispatcher.shutdown();
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_find_and_lock,
    bench_lost_lock,
    bench_acquisition_cycle
);
criterion_main!(benches);
