//! Runtime task pool and timer benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshdb_core::{DbResult, RuntimeConfig, RuntimeContext, TimerAction, TimerId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

/// Schedule `count` tasks and wait for all of them.
fn run_tasks(runtime: &RuntimeContext, count: usize, queued: bool) {
    let done = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    for _ in 0..count {
        let done = Arc::clone(&done);
        let tx = tx.clone();
        let task = Box::new(move || {
            if done.fetch_add(1, Ordering::SeqCst) + 1 == count {
                let _ = tx.send(());
            }
        });
        if queued {
            runtime.schedule_queued_task("bench", task).unwrap();
        } else {
            runtime.schedule_task(task).unwrap();
        }
    }
    rx.recv().unwrap();
}

/// Benchmark task scheduling, free and queued.
fn bench_tasks(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_pool");
    let runtime = RuntimeContext::new(RuntimeConfig::new().task_threads(2, 4));

    for count in [100, 1000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("schedule", count), &count, |b, &count| {
            b.iter(|| run_tasks(&runtime, black_box(count), false));
        });
        group.bench_with_input(BenchmarkId::new("queued", count), &count, |b, &count| {
            b.iter(|| run_tasks(&runtime, black_box(count), true));
        });
    }

    group.finish();
}

/// Benchmark timer registration and removal.
fn bench_timers(c: &mut Criterion) {
    let mut group = c.benchmark_group("timers");
    let runtime = RuntimeContext::new(RuntimeConfig::default());
    let action: TimerAction = Arc::new(|_: TimerId| -> DbResult<()> { Ok(()) });

    group.bench_function("set_remove", |b| {
        b.iter(|| {
            let id = runtime.set_timer(60_000, Arc::clone(&action), None).unwrap();
            runtime.remove_timer(black_box(id), false);
        });
    });

    group.bench_function("modify", |b| {
        let id = runtime.set_timer(60_000, Arc::clone(&action), None).unwrap();
        b.iter(|| runtime.modify_timer(black_box(id), 60_000).unwrap());
        runtime.remove_timer(id, true);
    });

    group.finish();
}

criterion_group!(benches, bench_tasks, bench_timers);
criterion_main!(benches);
