//! Decode Queue Benchmarks
//!
//! Throughput of the background decode worker for many small jobs

use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use resound_core::decode::{DecodeJob, DecodeQueue};

struct ChunkedJob {
    remaining: AtomicUsize,
    done: Arc<AtomicUsize>,
}

impl DecodeJob for ChunkedJob {
    fn advance(&self) -> bool {
        // Stand-in for decoding one chunk
        let mut acc = 0u64;
        for i in 0..256u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        black_box(acc);

        if self.remaining.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.done.fetch_add(1, Ordering::Release);
            false
        } else {
            true
        }
    }

    fn name(&self) -> &str {
        "chunked"
    }
}

fn bench_drain_jobs(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_queue_drain");

    for &jobs in &[1usize, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &jobs, |b, &jobs| {
            let queue = DecodeQueue::new();
            b.iter(|| {
                let done = Arc::new(AtomicUsize::new(0));
                for _ in 0..jobs {
                    queue.enqueue(Arc::new(ChunkedJob {
                        remaining: AtomicUsize::new(32),
                        done: done.clone(),
                    }));
                }
                while done.load(Ordering::Acquire) < jobs {
                    std::thread::yield_now();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_drain_jobs);
criterion_main!(benches);
