use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use peridot::core::array::Array;
use peridot::core::pool::Pool;

fn bench_pool_alloc(c: &mut Criterion) {
    c.bench_function("pool_alloc_small_64", |b| {
        let pool = Pool::create(64 * 1024).unwrap();
        b.iter(|| {
            pool.reset();
            for _ in 0..256 {
                black_box(pool.alloc(black_box(64)).unwrap());
            }
        });
    });

    c.bench_function("pool_alloc_large", |b| {
        let pool = Pool::create(4096).unwrap();
        b.iter(|| {
            let p = pool.alloc(black_box(8192)).unwrap();
            pool.free_large(p).unwrap();
        });
    });

    c.bench_function("pool_create_destroy", |b| {
        b.iter(|| {
            black_box(Pool::create(black_box(16 * 1024)).unwrap());
        });
    });
}

fn bench_array_push(c: &mut Criterion) {
    c.bench_function("array_push_1k", |b| {
        b.iter(|| {
            let pool = Pool::create(64 * 1024).unwrap();
            let mut array: Array<u64> = Array::new(&pool, 16).unwrap();
            for i in 0..1024u64 {
                array.push(black_box(i)).unwrap();
            }
            black_box(array.len());
        });
    });
}

criterion_group!(benches, bench_pool_alloc, bench_array_push);
criterion_main!(benches);
