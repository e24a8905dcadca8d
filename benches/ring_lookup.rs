//! Benchmarks for ring lookup and rebalancing.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ringroute::common::default_hasher;
use ringroute::{HashRing, LocalRouter};
use std::hint::black_box;

fn ring_with(servers: usize) -> HashRing {
    let mut ring = HashRing::new(150, default_hasher());
    for i in 0..servers {
        ring.add_server(&format!("node{}", i));
    }
    ring
}

fn bench_lookup(c: &mut Criterion) {
    let keys: Vec<String> = (0..1024).map(|i| format!("user:{}", i)).collect();

    let mut group = c.benchmark_group("ring_lookup");
    group.throughput(Throughput::Elements(keys.len() as u64));
    for &servers in &[2usize, 10, 50, 200] {
        let ring = ring_with(servers);
        group.bench_with_input(BenchmarkId::from_parameter(servers), &ring, |b, ring| {
            b.iter(|| {
                for key in &keys {
                    black_box(ring.lookup(key).ok());
                }
            });
        });
    }
    group.finish();
}

fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_join");
    for &connections in &[1_000usize, 10_000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(connections),
            &connections,
            |b, &connections| {
                b.iter_with_setup(
                    || {
                        let router = LocalRouter::new(150);
                        router.join("node1").ok();
                        router.join("node2").ok();
                        for i in 0..connections {
                            router.resolve_key(&format!("user:{}", i));
                        }
                        router
                    },
                    |router| black_box(router.join("node3").ok()),
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_lookup, bench_join);
criterion_main!(benches);
