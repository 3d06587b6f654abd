//! Benchmarks for the task queue hot path
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use cycler_rs::{Task, TaskPriority, TaskQueue};

fn mixed_priority(i: usize) -> TaskPriority {
    match i % 3 {
        0 => TaskPriority::High,
        1 => TaskPriority::Normal,
        _ => TaskPriority::Low,
    }
}

fn bench_submit_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue");

    for &size in &[100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_function(format!("submit_drain_{size}"), |b| {
            b.iter(|| {
                let queue = TaskQueue::new();
                for i in 0..size {
                    queue.submit_with_priority(
                        Task::Rest { channel: i % 32 },
                        mixed_priority(i),
                    );
                }
                while let Some(task) = queue.try_pop() {
                    black_box(task);
                }
            })
        });
    }

    group.finish();
}

fn bench_submit_only(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue_submit");
    group.throughput(Throughput::Elements(1));
    group.bench_function("single_submit", |b| {
        let queue = TaskQueue::new();
        let mut i = 0usize;
        b.iter(|| {
            queue.submit_with_priority(Task::Rest { channel: i % 32 }, mixed_priority(i));
            i += 1;
        });
    });
    group.finish();
}

criterion_group!(benches, bench_submit_drain, bench_submit_only);
criterion_main!(benches);
