use criterion::{black_box, criterion_group, criterion_main, Criterion};
use spsc_double_buffer::DoubleBuffer;
use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

pub fn benchmark(c: &mut Criterion) {
    let mut buf = DoubleBuffer::<u8>::default();

    {
        let (mut input, mut output) = buf.split();
        let mut uncontended = c.benchmark_group("uncontended");
        uncontended.bench_function("clean read", |b| b.iter(|| black_box(output.read())));
        uncontended.bench_function("write", |b| b.iter(|| input.write(black_box(0))));
        uncontended.bench_function("write and dirty read", |b| {
            b.iter(|| {
                input.write(black_box(0));
                black_box(output.read())
            })
        });
        uncontended.bench_function("write in place", |b| {
            b.iter(|| *input.start_writing() = black_box(0))
        });
        uncontended.finish();
    }

    {
        let (mut input, mut output) = buf.split();
        let running = AtomicBool::new(true);
        thread::scope(|s| {
            s.spawn(|| {
                while running.load(Ordering::Relaxed) {
                    black_box(output.read());
                }
            });
            let mut read_contended = c.benchmark_group("read contention");
            read_contended.bench_function("write", |b| b.iter(|| input.write(black_box(0))));
            read_contended.finish();
            running.store(false, Ordering::Relaxed);
        });
    }

    {
        let (mut input, mut output) = buf.split();
        let running = AtomicBool::new(true);
        thread::scope(|s| {
            s.spawn(|| {
                while running.load(Ordering::Relaxed) {
                    input.write(black_box(0));
                }
            });
            let mut write_contended = c.benchmark_group("write contention");
            write_contended.bench_function("read", |b| b.iter(|| black_box(output.read())));
            write_contended.finish();
            running.store(false, Ordering::Relaxed);
        });
    }
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
