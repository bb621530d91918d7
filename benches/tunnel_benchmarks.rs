//! Tunnel data-path benchmarks
//!
//! Benchmarks frame coding, the seal/open pipeline a relayed packet goes
//! through, and record throughput over a byte stream.
//!
//! Run with: `cargo bench --bench tunnel_benchmarks`

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};
use yuki_core::Channel;
use yuki_core::Frame;
use yuki_core::frame::{open_frame, seal_frame};
use yuki_crypto::{AeadKey, Role, SessionCipher};

const PACKET_SIZES: [usize; 4] = [64, 576, 1500, 9000];

/// Benchmark plaintext frame encoding and decoding
fn bench_frame_coding(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_coding");

    for size in PACKET_SIZES {
        let frame = Frame::data(vec![0x45; size]);
        let encoded = frame.encode();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode()));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| Frame::decode(black_box(encoded)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark one packet through encode, seal, open and decode
fn bench_relay_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_pipeline");
    let key = AeadKey::new([0x17; 32]);

    for size in PACKET_SIZES {
        let frame = Frame::data(vec![0x45; size]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter_batched(
                || {
                    let (sealer, _) =
                        SessionCipher::new(key.clone(), Role::Initiator).into_halves();
                    let (_, opener) =
                        SessionCipher::new(key.clone(), Role::Responder).into_halves();
                    (sealer, opener)
                },
                |(mut sealer, mut opener)| {
                    let envelope = seal_frame(&mut sealer, black_box(frame)).unwrap();
                    open_frame(&mut opener, &envelope).unwrap()
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark sealed records crossing an in-memory byte stream
fn bench_stream_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_records");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    const BATCH: usize = 64;

    for size in [576, 1500] {
        let key = AeadKey::new([0x17; 32]);
        let (mut sealer, _) = SessionCipher::new(key, Role::Initiator).into_halves();
        let record = seal_frame(&mut sealer, &Frame::data(vec![0x45; size])).unwrap();
        group.throughput(Throughput::Bytes((size * BATCH) as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &record, |b, record| {
            b.iter(|| {
                runtime.block_on(async {
                    let (a, z) = tokio::io::duplex(1 << 20);
                    let Channel { mut sink, .. } = Channel::from_stream(a);
                    let Channel { mut source, .. } = Channel::from_stream(z);
                    for _ in 0..BATCH {
                        sink.send(record.clone()).await.unwrap();
                    }
                    for _ in 0..BATCH {
                        black_box(source.recv().await.unwrap());
                    }
                });
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_coding,
    bench_relay_pipeline,
    bench_stream_records
);
criterion_main!(benches);
