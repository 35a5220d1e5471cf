//! Allocator fast-path and thread-churn benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use polyheap_core::cache::LocalCache;
use polyheap_core::pool::GlobalPool;

fn bench_cache_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("local_cache", size), &size, |b, &sz| {
            let mut cache = LocalCache::new(GlobalPool::instance());
            b.iter(|| {
                let ptr = cache.malloc(sz);
                // SAFETY: ptr came from this cache a moment ago.
                unsafe { cache.free(criterion::black_box(ptr)) };
            });
            cache.retire();
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
    }
    group.finish();
}

fn bench_cache_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("1000x64B", |b| {
        let mut cache = LocalCache::new(GlobalPool::instance());
        let mut ptrs = Vec::with_capacity(1000);
        b.iter(|| {
            for _ in 0..1000 {
                ptrs.push(cache.malloc(64));
            }
            for ptr in ptrs.drain(..) {
                // SAFETY: every ptr came from this cache in this iteration.
                unsafe { cache.free(ptr) };
            }
        });
        cache.retire();
    });

    group.finish();
}

fn bench_thread_churn(c: &mut Criterion) {
    // Thread creation goes through the interception layer linked into this
    // binary, so each spawn pays TLAB setup and teardown.
    let mut group = c.benchmark_group("thread_churn");
    group.sample_size(20);

    group.bench_function("spawn_join_8", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    std::thread::spawn(|| {
                        let v = vec![0u8; 256];
                        criterion::black_box(v.len())
                    })
                })
                .collect();
            for handle in handles {
                let _ = handle.join();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_cache_cycle,
    bench_cache_burst,
    bench_thread_churn
);
criterion_main!(benches);
