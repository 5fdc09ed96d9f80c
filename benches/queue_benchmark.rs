//! Performance benchmarks for hopper
//!
//! Run with: cargo bench

use std::io::Cursor;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hopper::{QueueState, QueueStateMux};

fn timeout() -> Duration {
    Duration::from_secs(60)
}

fn bench_push_pop_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_pop_complete");

    for size in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let qs = QueueState::new(timeout());
                for i in 0..size {
                    qs.push(&format!("task-{i}"), 0);
                }
                while let (Some(view), _) = qs.pop(None) {
                    qs.completed(&view.id);
                }
            });
        });
    }
    group.finish();
}

fn bench_pop_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("pop_batch");

    for size in [100usize, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let qs = QueueState::new(timeout());
                for i in 0..size {
                    qs.push(&format!("task-{i}"), 0);
                }
                let (tasks, _) = qs.pop_batch(size, None);
                assert_eq!(tasks.len(), size);
            });
        });
    }
    group.finish();
}

fn bench_keepalive(c: &mut Criterion) {
    c.bench_function("keepalive_1000_running", |b| {
        let qs = QueueState::new(timeout());
        let mut ids = Vec::new();
        for i in 0..1000 {
            ids.push(qs.push(&format!("task-{i}"), 0).unwrap());
        }
        qs.pop_batch(1000, None);

        let mut cursor = 0;
        b.iter(|| {
            let id = &ids[cursor % ids.len()];
            cursor += 1;
            assert!(qs.keepalive(id, None));
        });
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    c.bench_function("snapshot_10_contexts_x_100_tasks", |b| {
        let mux = QueueStateMux::new(timeout());
        for ctx in 0..10 {
            mux.get(&format!("context-{ctx}"), |qs| {
                for i in 0..100 {
                    qs.push(&format!("task-{i}-payload"), 0);
                }
            })
            .unwrap();
        }

        b.iter(|| {
            let mut buf = Cursor::new(Vec::new());
            mux.serialize(&mut buf, false).unwrap();
            buf.into_inner().len()
        });
    });
}

criterion_group!(
    benches,
    bench_push_pop_complete,
    bench_pop_batch,
    bench_keepalive,
    bench_snapshot_encode
);
criterion_main!(benches);
