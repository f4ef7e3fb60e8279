//! Condition variable dispatch benchmarks.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use portsync_core::{MutexKind, Timeout};
use portsync_sys::{Condvar, Mutex, SyncOps, dispatch};

fn bench_wake_without_waiters(c: &mut Criterion) {
    let mut group = c.benchmark_group("cond_var_wake");
    let cv = dispatch::create_cond_var();

    group.bench_function("signal", |b| {
        b.iter(|| unsafe { dispatch::signal_cond_var(black_box(cv)) });
    });
    group.bench_function("broadcast", |b| {
        b.iter(|| unsafe { dispatch::broadcast_cond_var(black_box(cv)) });
    });

    unsafe { dispatch::free_cond_var(cv) };
    group.finish();
}

fn bench_zero_timeout_wait(c: &mut Criterion) {
    let mut group = c.benchmark_group("cond_var_wait");
    let m = Mutex::with_ops(SyncOps::native(), MutexKind::NonReentrant);
    let cv = Condvar::with_ops(SyncOps::native());

    group.bench_function("zero_timeout", |b| {
        let mut guard = m.lock();
        b.iter(|| black_box(cv.wait(&mut guard, Timeout::ZERO)));
    });
    group.finish();
}

criterion_group!(benches, bench_wake_without_waiters, bench_zero_timeout_wait);
criterion_main!(benches);
