//! Recorder and replayer throughput over an in-memory log.

use std::io::Cursor;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use revdb_log::{Fetched, LogHeader, Recorder, Replayer, DEFAULT_BUFFER_CAPACITY};

const VALUES: u64 = 100_000;

fn record_values() -> Vec<u8> {
    let header = LogHeader::new([0, 0], vec![]);
    let mut rec = Recorder::new(Vec::new(), &header, DEFAULT_BUFFER_CAPACITY).unwrap();
    for i in 0..VALUES {
        rec.write(i).unwrap();
    }
    rec.write(0u64).unwrap();
    rec.finish().unwrap()
}

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("log");
    group.throughput(Throughput::Bytes(VALUES * 8));
    group.bench_function("record_u64", |b| b.iter(|| black_box(record_values())));

    let bytes = record_values();
    group.bench_function("replay_u64", |b| {
        b.iter(|| {
            let mut rep = Replayer::open(Cursor::new(bytes.as_slice())).unwrap();
            let mut sum = 0u64;
            for _ in 0..VALUES {
                if let Fetched::Value(v) = rep.read::<u64>().unwrap() {
                    sum = sum.wrapping_add(v);
                }
            }
            black_box(sum)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_record);
criterion_main!(benches);
