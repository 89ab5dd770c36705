//! Registry benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use uafsim_registry::ChunkRegistry;

fn bench_create_free_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_free_cycle");

    for &preload in &[0usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("preloaded", preload), &preload, |b, &n| {
            let reg = ChunkRegistry::new();
            for i in 0..n {
                reg.create(&format!("pre_{i}"));
            }
            b.iter(|| {
                let id = reg.allocate(64, &[0xAB; 64]);
                criterion::black_box(reg.free(id.as_str()));
            });
        });
    }
    group.finish();
}

fn bench_lookup_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_depth");
    let reg = ChunkRegistry::new();
    for i in 0..1024 {
        reg.create(&format!("obj_{i}"));
    }

    group.bench_function("use_first", |b| {
        b.iter(|| criterion::black_box(reg.use_chunk("obj_0")));
    });
    group.bench_function("use_last", |b| {
        b.iter(|| criterion::black_box(reg.use_chunk("obj_1023")));
    });
    group.bench_function("use_missing", |b| {
        b.iter(|| criterion::black_box(reg.use_chunk("ghost")));
    });

    group.finish();
}

criterion_group!(benches, bench_create_free_cycle, bench_lookup_depth);
criterion_main!(benches);
