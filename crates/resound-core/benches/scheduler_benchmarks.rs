//! Scheduler Benchmarks
//!
//! Cost of inline execution on the owner versus queue-and-drain

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use resound_core::scheduler::Scheduler;

fn bench_inline(c: &mut Criterion) {
    let scheduler = Scheduler::new();
    scheduler.bind_to_current_thread();

    c.bench_function("scheduler_inline_enqueue", |b| {
        b.iter(|| {
            let pending = scheduler.enqueue(|| black_box(7u32) * 6);
            black_box(pending.wait())
        });
    });
}

fn bench_queued(c: &mut Criterion) {
    let scheduler = Scheduler::new();

    c.bench_function("scheduler_queue_and_drain_64", |b| {
        b.iter(|| {
            for i in 0..64u32 {
                drop(scheduler.enqueue(move || black_box(i)));
            }
            black_box(scheduler.run_pending())
        });
    });
}

criterion_group!(benches, bench_inline, bench_queued);
criterion_main!(benches);
