use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use chanbus::eventlog::{EventLog, LogMode};

const RECORDS_PER_ITER: usize = 10_000;

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("eventlog_write");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let log = EventLog::open(dir.path().join("bench.log"), LogMode::Write)
                        .expect("open log");
                    (dir, log, vec![0u8; size])
                },
                |(_dir, mut log, payload)| {
                    for n in 0..RECORDS_PER_ITER {
                        log.write_record(n as i64, "BENCH", black_box(&payload))
                            .expect("write");
                    }
                    log.flush().expect("flush");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_seek(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("seek.log");
    let mut log = EventLog::open(&path, LogMode::Write).expect("open log");
    for n in 0..RECORDS_PER_ITER {
        log.write_record(n as i64 * 10, "BENCH", &[0u8; 128]).expect("write");
    }
    log.close().expect("close");

    let mut reader = EventLog::open(&path, LogMode::Read).expect("open reader");
    let mut target = 0i64;
    c.bench_function("eventlog_seek_to_timestamp", |b| {
        b.iter(|| {
            target = (target + 7_919) % (RECORDS_PER_ITER as i64 * 10);
            reader.seek_to_timestamp(black_box(target)).expect("seek");
            black_box(reader.read_next_record().expect("read"));
        });
    });
}

criterion_group!(benches, bench_write, bench_seek);
criterion_main!(benches);
