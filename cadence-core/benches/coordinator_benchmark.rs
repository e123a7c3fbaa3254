use std::hint::black_box;

use cadence_core::{
    Mutation, MutationContext, ObjectPatch, PropertyKey, SharedList, SharedObject, StructureId,
    Summary, UpdateCoordinator,
};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

fn document(items: usize) -> UpdateCoordinator {
    let mut root = SharedList::with_id(StructureId::from("root"));
    for i in 0..items {
        let mut shape = SharedObject::with_id(StructureId::from(format!("shape-{i}")));
        shape.property("x", 0.0f64);
        shape.property("y", 0.0f64);
        root.add(Box::new(shape));
    }
    UpdateCoordinator::new(Box::new(root))
}

fn bench_local_set(c: &mut Criterion) {
    let mut coordinator = document(100);
    let target = StructureId::from("shape-50");
    let x = PropertyKey::<f64>::new("x");
    let mut value = 0.0;

    c.bench_function("local_set_merged", |b| {
        b.iter(|| {
            value += 1.0;
            coordinator
                .set_merged(black_box(&target), &x, value, "drag")
                .unwrap();
        })
    });
}

fn bench_undo_redo(c: &mut Criterion) {
    let mut coordinator = document(100);
    let x = PropertyKey::<f64>::new("x");
    for i in 0..100 {
        let id = StructureId::from(format!("shape-{i}"));
        coordinator.set(&id, &x, i as f64).unwrap();
    }
    coordinator.commit();

    let mut group = c.benchmark_group("history");
    group.throughput(Throughput::Elements(100));
    group.bench_function("undo_redo_100_entries", |b| {
        b.iter(|| {
            coordinator.undo();
            coordinator.redo();
            black_box(coordinator.take_outbound());
        })
    });
    group.finish();
}

fn bench_process_remote(c: &mut Criterion) {
    let mut coordinator = document(100);
    let mutation = Mutation::new(StructureId::from("shape-10"), ObjectPatch::single("y", json!(4.5)));
    let mut seq = 0;

    c.bench_function("process_remote_patch", |b| {
        b.iter(|| {
            seq += 1;
            black_box(coordinator.process(black_box(&mutation), MutationContext::remote(seq)));
        })
    });
}

fn bench_summary_restore(c: &mut Criterion) {
    let coordinator = document(1000);
    let summary = coordinator.summary();
    let json = summary.to_json().unwrap();

    let mut group = c.benchmark_group("summary");
    group.bench_function("summarize_1k", |b| b.iter(|| black_box(coordinator.summary())));
    group.bench_function("restore_1k", |b| {
        b.iter(|| {
            let summary = Summary::from_json(black_box(&json)).unwrap();
            black_box(UpdateCoordinator::from_summary(&summary));
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_local_set,
    bench_undo_redo,
    bench_process_remote,
    bench_summary_restore
);
criterion_main!(benches);
