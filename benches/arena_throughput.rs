use blockarena::{MemoryResource, arena_resource, default_resource};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// Allocate then free immediately.
fn churn(resource: &dyn MemoryResource, size: usize) {
  for _ in 0..OPS {
    let ptr = resource.allocate(size, 8).unwrap();
    black_box(ptr);
    unsafe { resource.deallocate(ptr, size, 8) };
  }
}

/// Allocate a batch, then free it in allocation order.
fn batch(resource: &dyn MemoryResource, size: usize, ptrs: &mut Vec<core::ptr::NonNull<u8>>) {
  for _ in 0..OPS {
    ptrs.push(resource.allocate(size, 8).unwrap());
  }
  for ptr in ptrs.drain(..) {
    unsafe { resource.deallocate(ptr, size, 8) };
  }
}

fn benchmark_churn(c: &mut Criterion) {
  let mut group = c.benchmark_group("churn");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("arena", size), &size, |b, &size| {
      b.iter(|| churn(arena_resource(), size))
    });

    group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
      b.iter(|| churn(default_resource(), size))
    });
  }

  group.finish();
}

fn benchmark_batch(c: &mut Criterion) {
  let mut group = c.benchmark_group("batch");
  let mut ptrs = Vec::with_capacity(OPS as usize);

  for size in [16, 256, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("arena", size), &size, |b, &size| {
      b.iter(|| batch(arena_resource(), size, &mut ptrs))
    });

    group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
      b.iter(|| batch(default_resource(), size, &mut ptrs))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_churn, benchmark_batch);
criterion_main!(benches);
