use blockarc::checksum::koopman;
use blockarc::codec::{CodecId, CodecOptions};
use blockarc::pipeline::{Pipeline, PipelineConfig};
use blockarc::write_buffer::WriteBuffer;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::io::{self, Cursor};

const SIZE: usize = 8 * 1024 * 1024;

fn corpus() -> Vec<u8> {
    (0..SIZE).map(|i| (i % 251) as u8 ^ ((i / 4096) as u8)).collect()
}

fn config(workers: usize) -> PipelineConfig {
    PipelineConfig { workers, ..PipelineConfig::default() }
}

fn bench_checksum(c: &mut Criterion) {
    let data = vec![0xA5u8; 1024 * 1024];
    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("koopman_1mb", |b| b.iter(|| koopman(black_box(&data))));
    group.finish();
}

fn bench_compress(c: &mut Criterion) {
    let data = corpus();
    let mut group = c.benchmark_group("compress_8mb");
    group.throughput(Throughput::Bytes(SIZE as u64));
    group.sample_size(10);

    for codec in [CodecId::Flate, CodecId::GZip, CodecId::Lzw, CodecId::Nop] {
        for workers in [1, num_cpus::get()] {
            let mut pipeline = Pipeline::new(CodecOptions::new(codec), config(workers)).unwrap();
            group.bench_function(format!("{}_{}w", codec.name(), workers), |b| {
                b.iter(|| {
                    let mut out = WriteBuffer::new(io::sink(), 1024 * 1024);
                    pipeline.compress_file(&mut Cursor::new(black_box(&data)), &mut out).unwrap()
                })
            });
        }
    }
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let data = corpus();
    let mut pipeline = Pipeline::new(CodecOptions::new(CodecId::Flate), config(num_cpus::get())).unwrap();
    let mut out = WriteBuffer::new(Vec::new(), 1024 * 1024);
    pipeline.compress_file(&mut Cursor::new(&data), &mut out).unwrap();
    let stream = out.into_inner().unwrap();

    let mut group = c.benchmark_group("read_8mb");
    group.throughput(Throughput::Bytes(SIZE as u64));
    group.sample_size(10);
    group.bench_function("verify", |b| {
        b.iter(|| pipeline.verify_file(&mut Cursor::new(black_box(&stream))).unwrap())
    });
    group.bench_function("decompress", |b| {
        b.iter(|| {
            let mut sink = WriteBuffer::new(io::sink(), 1024 * 1024);
            pipeline.decompress_file(&mut Cursor::new(black_box(&stream)), &mut sink).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_checksum, bench_compress, bench_verify);
criterion_main!(benches);
