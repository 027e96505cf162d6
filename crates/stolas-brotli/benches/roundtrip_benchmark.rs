//! Round-trip throughput benchmarks across quality levels.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stolas_brotli::BrotliCodec;
use stolas_core::{CompressionLevel, Compressor, Decompressor};

fn text_corpus(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut line = 0usize;
    while data.len() < size {
        data.extend_from_slice(b"A benchmark corpus needs realistic structure: words, ");
        data.extend_from_slice(format!("punctuation, and repetition (line {}).\n", line).as_bytes());
        line += 1;
    }
    data.truncate(size);
    data
}

fn bench_compress(c: &mut Criterion) {
    let data = text_corpus(1 << 18);
    let mut group = c.benchmark_group("compress");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for quality in [1i32, 5, 9, 11] {
        group.bench_with_input(BenchmarkId::from_parameter(quality), &quality, |b, &q| {
            let codec = BrotliCodec::with_level(CompressionLevel::Custom(q));
            b.iter(|| codec.compress(black_box(&data)).unwrap());
        });
    }
    group.finish();
}

fn bench_decompress(c: &mut Criterion) {
    let data = text_corpus(1 << 18);
    let compressed = BrotliCodec::with_level(CompressionLevel::Best)
        .compress(&data)
        .unwrap();
    let mut group = c.benchmark_group("decompress");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("text_256k", |b| {
        let codec = BrotliCodec::new();
        b.iter(|| codec.decompress(black_box(&compressed)).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_compress, bench_decompress);
criterion_main!(benches);
