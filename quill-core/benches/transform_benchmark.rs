use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use quill_core::{compose, transform, Operation};

fn typing_op(len: usize, offset: usize) -> Operation {
    Operation::insert_at(len, offset, "x")
}

fn bench_apply_large_document(c: &mut Criterion) {
    let doc = "lorem ipsum ".repeat(10_000);
    let len = doc.chars().count();
    let op = typing_op(len, len / 2);

    c.bench_function("apply_insert_120k_chars", |b| {
        b.iter(|| black_box(op.apply(black_box(&doc)).unwrap()))
    });
}

fn bench_transform_pair(c: &mut Criterion) {
    let a = typing_op(10_000, 100);
    let b = Operation::delete_at(10_000, 50, 200);

    c.bench_function("transform_insert_vs_delete", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b)).unwrap()))
    });
}

fn bench_rebase_over_history(c: &mut Criterion) {
    // 100 concurrent keystrokes to rebase over, as a lagging client would.
    let base_len = 1_000;
    let mut history = Vec::new();
    for i in 0..100 {
        history.push(typing_op(base_len + i, i * 3));
    }
    let stale = typing_op(base_len, 500);

    c.bench_function("rebase_over_100_ops", |b| {
        b.iter(|| {
            let mut op = stale.clone();
            for applied in &history {
                op = transform(applied, &op).unwrap().1;
            }
            black_box(op)
        })
    });
}

fn bench_compose_keystrokes(c: &mut Criterion) {
    c.bench_function("compose_50_keystrokes", |b| {
        b.iter(|| {
            let mut acc = Operation::identity(100);
            for i in 0..50 {
                let next = typing_op(100 + i, 10 + i);
                acc = compose(&acc, &next).unwrap();
            }
            black_box(acc)
        })
    });
}

criterion_group!(
    benches,
    bench_apply_large_document,
    bench_transform_pair,
    bench_rebase_over_history,
    bench_compose_keystrokes,
);
criterion_main!(benches);
