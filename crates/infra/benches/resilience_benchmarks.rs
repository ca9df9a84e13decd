use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{TimeZone, Utc};
use std::time::Duration;
use tokio::time::Instant;

use cvewatch_infra::locks::JobLockManager;
use cvewatch_infra::rate_limit::TokenBucket;
use cvewatch_infra::retry::RetryConfig;
use cvewatch_infra::scheduler::TriggerSpec;

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let config = RetryConfig::default();

    for attempt in [1u32, 4, 16, 64].iter() {
        group.bench_with_input(
            BenchmarkId::new("backoff_for_attempt", attempt),
            attempt,
            |b, &attempt| {
                b.iter(|| black_box(config.backoff_for_attempt(black_box(attempt))));
            },
        );
    }

    group.bench_function("delay_after_failure_with_jitter", |b| {
        let mut rng = rand::rng();
        b.iter(|| black_box(config.delay_after_failure(black_box(3), &mut rng)));
    });

    group.finish();
}

fn bench_next_fire(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_fire");
    let wall = Utc.with_ymd_and_hms(2024, 3, 10, 21, 30, 0).unwrap();

    let daily = TriggerSpec::daily_at(2, 0);
    group.bench_function("daily_at", |b| {
        b.iter(|| black_box(daily.next_calendar_time(black_box(wall))));
    });

    let twice = TriggerSpec::daily_at_hours([8, 20], 0);
    group.bench_function("multi_daily_at", |b| {
        b.iter(|| black_box(twice.next_calendar_time(black_box(wall))));
    });

    let hourly = TriggerSpec::every(Duration::from_secs(3600));
    let start = Instant::now();
    let late = start + Duration::from_secs(10 * 3600 + 17);
    group.bench_function("interval_catch_up", |b| {
        b.iter(|| black_box(hourly.next_fire(start, black_box(late), wall)));
    });

    group.finish();
}

fn bench_token_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_bucket");
    group.throughput(Throughput::Elements(1));

    group.bench_function("reserve", |b| {
        let mut bucket = TokenBucket::new(60, Instant::now());
        b.iter(|| black_box(bucket.reserve(Instant::now())));
    });

    group.finish();
}

fn bench_job_locks(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_locks");
    group.throughput(Throughput::Elements(1));
    let timeout = Duration::from_secs(600);

    group.bench_function("acquire_release", |b| {
        let locks = JobLockManager::new();
        b.iter(|| {
            black_box(locks.acquire("cve_collector", timeout));
            locks.release("cve_collector");
        });
    });

    group.bench_function("acquire_denied", |b| {
        let locks = JobLockManager::new();
        locks.acquire("cve_collector", timeout);
        b.iter(|| black_box(locks.acquire("cve_collector", timeout)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_backoff,
    bench_next_fire,
    bench_token_bucket,
    bench_job_locks
);
criterion_main!(benches);
