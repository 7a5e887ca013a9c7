// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Ring buffer and counter benchmarks.
//
// Run with:
//   cargo bench --bench ring
//
// Groups:
//   counter          : uncontended SaturatingCounter::increment
//   ring_round_trip  : produce + consume of one record, heap provider
//   ring_contended   : two producer threads against one consumer
//
// Record sizes:
//   u64          : 8-byte payload
//   trace_record : 256-byte TraceRecord

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use libtrace::{HeapShm, RingConfig, SaturatingCounter, SharedRingBuffer, TraceRecord};

// ---------------------------------------------------------------------------
// SaturatingCounter
// ---------------------------------------------------------------------------

fn bench_counter(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter");
    group.throughput(Throughput::Elements(1));

    group.bench_function("increment_u64_63", |b| {
        let counter = SaturatingCounter::<AtomicU64, 63>::new();
        b.iter(|| black_box(counter.increment()));
    });

    group.bench_function("increment_if_u64_63", |b| {
        let counter = SaturatingCounter::<AtomicU64, 63>::new();
        b.iter(|| black_box(counter.increment_if(|_| true)));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Single-thread round trip
// ---------------------------------------------------------------------------

fn round_trip<T: Copy + Default + Send + 'static>(c: &mut Criterion, label: &str, record: T) {
    let mut group = c.benchmark_group("ring_round_trip");
    group.throughput(Throughput::Bytes(std::mem::size_of::<T>() as u64));

    for &capacity in &[16usize, 1024] {
        let shm = HeapShm::new();
        let ring =
            SharedRingBuffer::<T>::create(&shm, &RingConfig::new("bench_rt", capacity)).unwrap();
        group.bench_with_input(
            BenchmarkId::new(label, capacity),
            &capacity,
            |b, _| {
                b.iter(|| {
                    ring.produce(black_box(&record)).unwrap();
                    black_box(ring.consume().unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    round_trip(c, "u64", 42u64);
    round_trip(c, "trace_record", TraceRecord::new(1, &[0xAB; 200]));
}

// ---------------------------------------------------------------------------
// Contended: two producers, measured consumer
// ---------------------------------------------------------------------------

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_contended");
    group.throughput(Throughput::Elements(1));

    let shm = HeapShm::new();
    let ring = Arc::new(
        SharedRingBuffer::<u64>::create(&shm, &RingConfig::new("bench_mpsc", 256)).unwrap(),
    );
    let stop = Arc::new(AtomicBool::new(false));
    let producers: Vec<_> = (0..2u64)
        .map(|p| {
            let ring = Arc::clone(&ring);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut v = p;
                while !stop.load(Ordering::Relaxed) {
                    if ring.try_produce(&v).unwrap_or(false) {
                        v += 2;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    group.bench_function("consume_2p", |b| {
        b.iter(|| loop {
            if let Ok(v) = ring.consume() {
                break black_box(v);
            }
        });
    });

    stop.store(true, Ordering::Relaxed);
    for p in producers {
        p.join().unwrap();
    }
    group.finish();
}

criterion_group!(benches, bench_counter, bench_round_trip, bench_contended);
criterion_main!(benches);
