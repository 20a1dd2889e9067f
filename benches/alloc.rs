// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocation strategy benchmarks.
//
// Run with:
//   cargo bench --bench alloc
//
// Groups:
//   buffer_global — Vec<u8> via the global allocator (baseline)
//   pool_alloc    — PoolAllocator::alloc/free round trip through the real
//                   startup path (lifecycle::init), single process
//
// Each group exercises the same workload at three sizes spanning the
// buddy allocator's smaller size classes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dma_pool::{lifecycle, NullDevice, PoolAllocator, SimpleOwner, StandaloneHost};

const SMALL: usize = 48;
const MEDIUM: usize = 256;
const LARGE: usize = 4096;

const SIZES: &[(&str, usize)] = &[
    ("small_48", SMALL),
    ("medium_256", MEDIUM),
    ("large_4096", LARGE),
];

fn bench_global_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_global");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let v: Vec<u8> = vec![0xABu8; sz];
                black_box(v)
            });
        });
    }

    group.finish();
}

fn bench_pool_alloc(c: &mut Criterion) {
    let host = StandaloneHost::new("bench", 0)
        .with_config("dma_segment_size", 1 << 28)
        .with_config("max_dma_segment_nums", 4)
        .with_config("min_dma_segment_nums", 1);
    let ctx = lifecycle::init(Box::new(host), Box::new(NullDevice)).expect("pool init");
    let pool = PoolAllocator::new(ctx);
    let owner = SimpleOwner::new(1);

    let mut group = c.benchmark_group("pool_alloc");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let ptr = pool.alloc(&owner, sz).unwrap();
                black_box(ptr);
                pool.free(&owner, ptr).unwrap();
            });
        });
    }
    group.finish();

    pool.free_all(&owner).ok();
}

criterion_group!(benches, bench_global_alloc, bench_pool_alloc);
criterion_main!(benches);
