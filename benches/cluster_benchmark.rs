//! Benchmarks for slot routing.
//!
//! Run benchmarks:
//! ```bash
//! cargo bench --bench cluster_benchmark
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slotmux::cluster::{parse_cluster_nodes, ClusterNode, NodeFlag, Partitions};
use slotmux::key_slot;

fn three_masters() -> Vec<ClusterNode> {
    vec![
        ClusterNode::new("n1", "127.0.0.1", 7000)
            .with_flag(NodeFlag::Master)
            .with_slots(0, 5460),
        ClusterNode::new("n2", "127.0.0.1", 7001)
            .with_flag(NodeFlag::Master)
            .with_slots(5461, 10922),
        ClusterNode::new("n3", "127.0.0.1", 7002)
            .with_flag(NodeFlag::Master)
            .with_slots(10923, 16383),
    ]
}

/// Benchmark: slot hashing for different key sizes.
fn bench_key_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_slot");

    for size in [8, 64, 512, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let key = vec![b'k'; size];
            b.iter(|| key_slot(black_box(&key)));
        });
    }

    group.bench_function("hash_tag", |b| {
        b.iter(|| key_slot(black_box("{user:1000}:profile:settings")));
    });

    group.finish();
}

/// Benchmark: resolving keys to their owning node.
fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    let partitions = Partitions::from_nodes(three_masters());
    let keys: Vec<String> = (0..1000).map(|i| format!("key:{}", i)).collect();

    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("node_for_key", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(partitions.node_for_slot(key_slot(key)));
            }
        });
    });

    group.bench_function("rebuild_slot_map", |b| {
        b.iter(|| partitions.load(black_box(three_masters())));
    });

    group.finish();
}

/// Benchmark: parsing CLUSTER NODES output.
fn bench_parse_topology(c: &mut Criterion) {
    let text = "07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected\n\
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922\n\
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383\n\
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460\n";

    c.bench_function("parse_cluster_nodes", |b| {
        b.iter(|| parse_cluster_nodes(black_box(text)).expect("valid topology"));
    });
}

criterion_group!(benches, bench_key_slot, bench_routing, bench_parse_topology);
criterion_main!(benches);
