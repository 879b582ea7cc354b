//! Performance benchmarks for herald.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use herald::{
    DeliveryEngine, Herald, HeraldConfig, Identity, MemoryChannel, Sequence, Sequencer,
};
use std::sync::Arc;
use tempfile::TempDir;

fn create_herald(dir: &TempDir) -> Herald {
    Herald::create(HeraldConfig {
        path: dir.path().join("herald"),
        ..Default::default()
    })
    .unwrap()
}

/// Durable submission to an offline recipient (journal append + fsync).
fn bench_durable_submit(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let herald = create_herald(&dir);
    let user = Identity::new("bench").unwrap();

    c.bench_function("durable_submit", |b| {
        b.iter(|| {
            black_box(herald.submit(&user, b"payload".to_vec()).unwrap());
        });
    });
}

/// In-memory submission pushed to a live channel.
fn bench_live_push(c: &mut Criterion) {
    let engine = Arc::new(DeliveryEngine::in_memory());
    let user = Identity::new("bench").unwrap();
    let (channel, receiver) = MemoryChannel::pair(1024);
    let session = engine.connect(user.clone(), Arc::new(channel));
    session.recover(Sequence::ZERO).unwrap();

    c.bench_function("live_push", |b| {
        b.iter(|| {
            engine.submit(&user, b"payload".to_vec()).unwrap();
            black_box(receiver.try_recv().unwrap());
        });
    });
}

/// Recovery replay with varying backlog sizes
fn bench_recovery_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery_replay");

    for backlog in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("backlog", backlog), &backlog, |b, &backlog| {
            let engine = Arc::new(DeliveryEngine::in_memory());
            let user = Identity::new("bench").unwrap();
            for i in 0..backlog {
                engine.submit(&user, i.to_le_bytes().to_vec()).unwrap();
            }

            b.iter(|| {
                let (channel, receiver) = MemoryChannel::pair(backlog + 1);
                let session = engine.connect(user.clone(), Arc::new(channel));
                black_box(session.recover(Sequence::ZERO).unwrap());
                black_box(receiver.drain().unwrap());
            });
        });
    }

    group.finish();
}

/// Sequencer reservations with varying block sizes
fn bench_sequencer_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencer_block");

    for block in [1u64, 64, 1024] {
        group.bench_with_input(BenchmarkId::new("block", block), &block, |b, &block| {
            let dir = TempDir::new().unwrap();
            let sequencer = Sequencer::open(dir.path().join("sequences.log"), block).unwrap();
            let user = Identity::new("bench").unwrap();

            b.iter(|| {
                black_box(sequencer.next(&user).unwrap());
            });
        });
    }

    group.finish();
}

/// Reopening a data directory with a populated outbox
fn bench_reopen(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    {
        let herald = create_herald(&dir);
        for i in 0..500u32 {
            let user = Identity::new(format!("user-{}", i % 10)).unwrap();
            herald.submit(&user, i.to_le_bytes().to_vec()).unwrap();
        }
    }

    c.bench_function("reopen_500", |b| {
        b.iter(|| {
            let herald = Herald::open(HeraldConfig {
                path: dir.path().join("herald"),
                ..Default::default()
            })
            .unwrap();
            black_box(herald.stats());
        });
    });
}

criterion_group!(
    benches,
    bench_durable_submit,
    bench_live_push,
    bench_recovery_replay,
    bench_sequencer_blocks,
    bench_reopen,
);

criterion_main!(benches);
