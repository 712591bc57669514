//! Storage benchmarks: raw backends, WAL transactions and the data file.

use boxdb_bench::random_data;
use boxdb_core::segment::{SegmentManager, SegmentRecord};
use boxdb_core::wal::{WalManager, WalRecord};
use boxdb_core::{RecordKey, SequenceNumber, TransactionId};
use boxdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

/// Benchmark raw appends to both backends.
fn bench_backend_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("backend_append");
    group.sample_size(50);

    for size in [64, 1024, 4096] {
        group.throughput(Throughput::Bytes(size as u64));
        let data = random_data(size);

        group.bench_with_input(BenchmarkId::new("memory", size), &data, |b, data| {
            let mut backend = InMemoryBackend::new();
            b.iter(|| black_box(backend.append(black_box(data)).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("file", size), &data, |b, data| {
            let temp_dir = TempDir::new().unwrap();
            let mut backend = FileBackend::open(&temp_dir.path().join("bench.dat")).unwrap();
            b.iter(|| black_box(backend.append(black_box(data)).unwrap()));
        });
    }
    group.finish();
}

fn transaction(txid: u64, puts: usize, payload: &[u8]) -> Vec<WalRecord> {
    let txid = TransactionId::new(txid);
    let mut records = vec![WalRecord::Begin { txid }];
    records.extend((0..puts).map(|i| WalRecord::Put {
        txid,
        key: RecordKey::object(1, i as u64 + 1),
        payload: payload.to_vec(),
    }));
    records.push(WalRecord::Commit {
        txid,
        sequence: SequenceNumber::new(txid.as_u64()),
    });
    records
}

/// Benchmark logging whole transactions, with and without fsync.
fn bench_wal_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_commit");
    group.sample_size(20);
    let payload = random_data(128);

    for puts in [1, 10, 100] {
        group.throughput(Throughput::Elements(puts as u64));
        group.bench_with_input(BenchmarkId::new("memory", puts), &puts, |b, &puts| {
            let wal = WalManager::new(Box::new(InMemoryBackend::new()), false);
            let mut txid = 0;
            b.iter(|| {
                txid += 1;
                wal.append_transaction(&transaction(txid, puts, &payload)).unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("file_synced", puts), &puts, |b, &puts| {
            let temp_dir = TempDir::new().unwrap();
            let backend = FileBackend::open(&temp_dir.path().join("wal.log")).unwrap();
            let wal = WalManager::new(Box::new(backend), true);
            let mut txid = 0;
            b.iter(|| {
                txid += 1;
                wal.append_transaction(&transaction(txid, puts, &payload)).unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark replaying a WAL the way recovery does.
fn bench_wal_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_replay");
    let wal = WalManager::new(Box::new(InMemoryBackend::new()), false);
    let payload = random_data(128);
    for txid in 1..=1000 {
        wal.append_transaction(&transaction(txid, 5, &payload)).unwrap();
    }
    group.throughput(Throughput::Elements(7000));
    group.bench_function("1000_transactions", |b| {
        b.iter(|| {
            let count = wal.iter().unwrap().filter(|item| item.is_ok()).count();
            black_box(count);
        });
    });
    group.finish();
}

/// Benchmark data file batches and positional record reads.
fn bench_data_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_file");
    let payload = random_data(256);
    let batch: Vec<SegmentRecord> = (1..=100)
        .map(|id| SegmentRecord::put(RecordKey::object(1, id), payload.clone(), SequenceNumber::new(1)))
        .collect();

    group.throughput(Throughput::Elements(100));
    group.bench_function("append_batch_100", |b| {
        let segments = SegmentManager::new(Box::new(InMemoryBackend::new()));
        b.iter(|| black_box(segments.append_batch(black_box(&batch)).unwrap()));
    });

    let segments = SegmentManager::new(Box::new(InMemoryBackend::new()));
    let locations = segments.append_batch(&batch).unwrap();
    let mut next = 0;
    group.throughput(Throughput::Elements(1));
    group.bench_function("read_record", |b| {
        b.iter(|| {
            let location = locations[(next * 7) % locations.len()];
            next += 1;
            black_box(segments.read(location).unwrap());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_backend_append,
    bench_wal_commit,
    bench_wal_replay,
    bench_data_file
);
criterion_main!(benches);
