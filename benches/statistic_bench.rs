//! Statistic Benchmark tests
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_history_ring(c: &mut Criterion) {
    use mihomo_statistic::common::Ring;
    use std::sync::Arc;

    let mut group = c.benchmark_group("history_ring");
    group.throughput(Throughput::Elements(1));

    // Benchmark steady-state append with eviction
    group.bench_function("append_evicting", |b| {
        let mut ring = Ring::new(1024);
        let record = Arc::new(0u64);
        b.iter(|| ring.append(black_box(&[record.clone()])))
    });

    // Benchmark a full-window page read
    group.bench_function("page_full_window", |b| {
        let mut ring = Ring::new(1024);
        let records: Vec<Arc<u64>> = (0..2048).map(Arc::new).collect();
        ring.append(&records);
        let mut out = Vec::with_capacity(1024);
        b.iter(|| {
            out.clear();
            black_box(ring.get_into(0, 1024, &mut out))
        })
    });

    group.finish();
}

fn bench_track_close(c: &mut Criterion) {
    use mihomo_statistic::common::{Chained, Metadata, DIRECT};
    use mihomo_statistic::StatisticManager;

    let manager = StatisticManager::new();

    let mut group = c.benchmark_group("tracking");
    group.throughput(Throughput::Elements(1));

    // Benchmark admission, history append and disposal of one connection
    group.bench_function("track_then_close", |b| {
        b.iter(|| {
            let (stream, _peer) = tokio::io::duplex(64);
            let conn = Chained::new(stream, [DIRECT].into_iter().collect());
            let tracked = manager.track_conn(conn, Metadata::tcp(), None).unwrap();
            black_box(tracked.id());
        })
    });

    // Benchmark the read-side snapshot with a populated registry
    group.bench_function("snapshot_256_open", |b| {
        let open: Vec<_> = (0..256)
            .map(|_| {
                let (stream, peer) = tokio::io::duplex(64);
                let conn = Chained::new(stream, ["proxy"].into_iter().collect());
                (manager.track_conn(conn, Metadata::tcp(), None).unwrap(), peer)
            })
            .collect();
        b.iter(|| black_box(manager.snapshot()));
        drop(open);
    });

    group.finish();
}

criterion_group!(benches, bench_history_ring, bench_track_close);
criterion_main!(benches);
