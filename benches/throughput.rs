//! Protocol throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use tinybms_link::core::protocol::crc::{crc16_bitwise, crc16_table};
use tinybms_link::core::protocol::{Frame, StreamReassembler};

fn crc_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("crc16");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("bitwise", |b| {
        b.iter(|| black_box(crc16_bitwise(black_box(&data))))
    });

    group.bench_function("table", |b| {
        b.iter(|| black_box(crc16_table(black_box(&data))))
    });

    group.finish();
}

fn reassembly_benchmark(c: &mut Criterion) {
    // A stream of back-to-back frames with occasional junk between them
    let mut stream = Vec::new();
    for i in 0u16..64 {
        stream.extend(Frame::read_individual(i).to_bytes());
        if i % 7 == 0 {
            stream.extend_from_slice(&[0x00, 0x13]);
        }
    }

    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("feed_bulk", |b| {
        b.iter(|| {
            let mut reassembler = StreamReassembler::new();
            black_box(reassembler.feed(black_box(&stream)))
        })
    });

    group.bench_function("feed_chunked", |b| {
        b.iter(|| {
            let mut reassembler = StreamReassembler::new();
            let mut frames = 0usize;
            for chunk in stream.chunks(16) {
                frames += reassembler.feed(chunk).len();
            }
            black_box(frames)
        })
    });

    group.finish();
}

criterion_group!(benches, crc_benchmark, reassembly_benchmark);
criterion_main!(benches);
