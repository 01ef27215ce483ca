//! Future-cell and routine micro-benchmarks.
//!
//! Run with: cargo bench -p weave

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use weave::{await_on, ready_future, FutureCell, Promise, Routine};

fn bench_cell_set_take(c: &mut Criterion) {
    c.bench_function("cell_set_take", |b| {
        b.iter(|| {
            let cell = FutureCell::new();
            cell.set_value(black_box(42u64));
            black_box(cell.take())
        })
    });
}

fn bench_promise_roundtrip(c: &mut Criterion) {
    c.bench_function("promise_set_future_get", |b| {
        b.iter(|| {
            let promise = Promise::new();
            let future = promise.future();
            promise.set_value(black_box(7u64));
            black_box(future.get())
        })
    });
}

fn bench_ready_future_await(c: &mut Criterion) {
    c.bench_function("await_ready_future", |b| {
        b.iter(|| black_box(await_on(ready_future(black_box(1u64)))))
    });
}

fn bench_routine_create_join(c: &mut Criterion) {
    // The body never suspends, so this measures stack setup, the switch
    // in and out, and result publication.
    c.bench_function("routine_create_join", |b| {
        b.iter(|| {
            let routine = Routine::new(|| black_box(3u64) * 2);
            black_box(routine.join())
        })
    });
}

criterion_group!(
    benches,
    bench_cell_set_take,
    bench_promise_roundtrip,
    bench_ready_future_await,
    bench_routine_create_join
);
criterion_main!(benches);
