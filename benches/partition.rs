//! Heap benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use partition_heap::{FixedHeap, GenericHeap, HeapConfig, PurgeFlags};

fn release_config() -> HeapConfig {
    HeapConfig {
        cookies: false,
        poison: false,
        ..HeapConfig::default()
    }
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");
    let heap = GenericHeap::with_config(release_config()).unwrap();

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("generic", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = heap.alloc(criterion::black_box(sz), "bench");
                unsafe { heap.free(ptr) };
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
    }

    let mut fixed = FixedHeap::with_config(&[16, 64, 256], release_config()).unwrap();
    group.bench_function("fixed/64", |b| {
        b.iter(|| {
            let ptr = fixed.alloc(criterion::black_box(64), "bench");
            unsafe { fixed.free(ptr) };
        });
    });
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");
    let heap = GenericHeap::with_config(release_config()).unwrap();

    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let ptrs: Vec<_> = (0..1000).map(|_| heap.alloc(64, "bench")).collect();
            for ptr in ptrs {
                unsafe { heap.free(ptr) };
            }
        });
    });

    group.finish();
}

fn bench_realloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("realloc");
    let heap = GenericHeap::with_config(release_config()).unwrap();

    group.bench_function("grow_16_to_4096", |b| {
        b.iter(|| {
            let mut ptr = Some(heap.alloc(16, "bench"));
            let mut size = 16;
            while size < 4096 {
                size *= 2;
                ptr = unsafe { heap.realloc(ptr, size, "bench") };
            }
            unsafe { heap.realloc(ptr, 0, "bench") };
        });
    });

    group.bench_function("direct_map_in_place", |b| {
        let ptr = heap.alloc(2_000_000, "bench");
        b.iter(|| {
            let smaller = unsafe { heap.realloc(Some(ptr), 1_800_000, "bench") };
            criterion::black_box(unsafe { heap.realloc(smaller, 2_000_000, "bench") });
        });
        unsafe { heap.free(ptr) };
    });

    group.finish();
}

fn bench_purge(c: &mut Criterion) {
    let mut group = c.benchmark_group("purge");
    let heap = GenericHeap::with_config(release_config()).unwrap();

    group.bench_function("decommit_empty_spans", |b| {
        b.iter(|| {
            let ptrs: Vec<_> = [16, 256, 4096, 65536]
                .iter()
                .map(|&size| heap.alloc(size, "bench"))
                .collect();
            for ptr in ptrs {
                unsafe { heap.free(ptr) };
            }
            heap.purge_memory(PurgeFlags::all());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_burst, bench_realloc, bench_purge);
criterion_main!(benches);
