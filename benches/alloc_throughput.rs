use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::alloc::{alloc as system_alloc, dealloc as system_dealloc, Layout};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// tieralloc alloc/free throughput.
fn tieralloc_alloc_free(size: usize) {
    for _ in 0..OPS {
        let ptr = tieralloc::alloc(size);
        black_box(ptr);
        unsafe {
            tieralloc::free(ptr);
        }
    }
}

/// System allocator alloc/free throughput.
fn system_alloc_free(size: usize) {
    let layout = Layout::from_size_align(size, 8).unwrap();
    for _ in 0..OPS {
        unsafe {
            let ptr = system_alloc(layout);
            black_box(ptr);
            system_dealloc(ptr, layout);
        }
    }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
    tieralloc::init();

    let mut group = c.benchmark_group("alloc_throughput");

    for size in [16, 48, 256, 1024, 4096, 100_000] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("tieralloc", size), &size, |b, &size| {
            b.iter(|| tieralloc_alloc_free(size))
        });

        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
            b.iter(|| system_alloc_free(size))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
