use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use pfs_alloc::{Bitmap, ByteBitmap, WordBitmap};

// One full 2^20-bit group bitmap.
const BITMAP_BYTES: usize = 128 * 1024;
const BATCH: usize = 10 * 1024;

fn bench_sequential_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_alloc");

    group.bench_function("byte_stride", |b| {
        b.iter_batched(
            || ByteBitmap::new(1, vec![0u8; BITMAP_BYTES]),
            |mut bm| {
                while bm.free_bits() >= BATCH {
                    let (addrs, _) = bm.alloc_bits(BATCH, BATCH, false);
                    criterion::black_box(addrs);
                }
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("word_stride", |b| {
        b.iter_batched(
            || WordBitmap::new(1, vec![0u8; BITMAP_BYTES]),
            |mut bm| {
                while bm.free_bits() >= BATCH {
                    let (addrs, _) = bm.alloc_bits(BATCH, BATCH, false);
                    criterion::black_box(addrs);
                }
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_big_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("big_alloc");

    group.bench_function("word_stride", |b| {
        b.iter_batched(
            || WordBitmap::new(1, vec![0u8; BITMAP_BYTES]),
            |mut bm| {
                while bm.free_bits() >= BATCH {
                    let (addrs, _) = bm.alloc_bits(BATCH, BATCH, true);
                    criterion::black_box(addrs);
                }
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_sequential_alloc, bench_big_alloc);
criterion_main!(benches);
