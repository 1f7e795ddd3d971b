use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use centralis::{CentralPools, LocalCache, PageHeap, SizeClassTable};

const OPS: u64 = 100_000;
const HEAP_PAGES: usize = 16 * 1024;

fn pools() -> CentralPools {
  CentralPools::new(
    PageHeap::new(HEAP_PAGES).expect("reserve bench heap"),
    SizeClassTable::default(),
  )
}

/// Refill/drain straight against the central pool.
fn central_batches(pools: &CentralPools, class: usize, batch: usize) {
  for _ in 0..OPS / batch as u64 {
    let objs = pools.allocate_batch(class, batch);
    black_box(objs.head());
    pools.free_batch(class, objs);
  }
}

/// Single-object alloc/free through a local cache.
fn cached_alloc_free(cache: &mut LocalCache<'_>, class: usize) {
  for _ in 0..OPS {
    let obj = cache.alloc(class).expect("bench heap exhausted");
    black_box(obj);
    unsafe { cache.dealloc(class, obj) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_batch_throughput(c: &mut Criterion) {
  let pools = pools();
  let mut group = c.benchmark_group("central_batch");
  group.throughput(Throughput::Elements(OPS));

  for batch in [1, 8, 32, 128] {
    group.bench_with_input(BenchmarkId::new("class0", batch), &batch, |b, &batch| {
      b.iter(|| central_batches(&pools, 0, batch))
    });
  }
  group.finish();
}

fn benchmark_cached_throughput(c: &mut Criterion) {
  let pools = pools();
  let mut group = c.benchmark_group("cached_alloc_free");

  for size in [16, 64, 256, 1024, 4096] {
    let class = pools.table().size_to_class(size).expect("size has a class");
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("centralis", size), &class, |b, &class| {
      let mut cache = LocalCache::new(&pools);
      b.iter(|| cached_alloc_free(&mut cache, class))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Several threads hammering the same size class.
fn benchmark_contended(c: &mut Criterion) {
  let pools = pools();
  let mut group = c.benchmark_group("contended_batches");
  group.throughput(Throughput::Elements(OPS * 4));

  group.bench_function("4_threads_batch_32", |b| {
    b.iter(|| {
      std::thread::scope(|s| {
        for _ in 0..4 {
          s.spawn(|| central_batches(&pools, 0, 32));
        }
      })
    })
  });

  group.finish();
}

criterion_group!(
  benches,
  benchmark_batch_throughput,
  benchmark_cached_throughput,
  benchmark_contended
);
criterion_main!(benches);
