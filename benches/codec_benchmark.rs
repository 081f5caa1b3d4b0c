//! Performance benchmarks for row framing and control-row classification
//!
//! Run with: cargo bench

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tablecopy::codec::{split_rows, ControlRowCodec, RowFraming, RowSplitter};
use tablecopy::table::TableFormat;
use tablecopy::write::ChunkBuilder;

/// YSON list fragment with a control row every `every` rows
fn yson_stream(rows: usize, every: usize) -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..rows {
        if i % every == 0 {
            data.extend_from_slice(format!("<\"row_index\"={};>#;\n", i).as_bytes());
        }
        data.extend_from_slice(
            format!("{{\"id\"={};\"name\"=\"user_{}\";\"tags\"=[\"a\";\"b\"]}};\n", i, i).as_bytes(),
        );
    }
    data
}

fn json_stream(rows: usize, every: usize) -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..rows {
        if i % every == 0 {
            data.extend_from_slice(
                format!("{{\"$attributes\":{{\"row_index\":{}}},\"$value\":null}}\n", i).as_bytes(),
            );
        }
        data.extend_from_slice(format!("{{\"id\":{},\"name\":\"user_{}\"}}\n", i, i).as_bytes());
    }
    data
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_framing");

    for (name, framing, data) in [
        ("yson", RowFraming::YsonListFragment, yson_stream(20_000, 1000)),
        ("json", RowFraming::Lines, json_stream(20_000, 1000)),
    ] {
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("split_rows", name), &data, |b, data| {
            b.iter(|| black_box(split_rows(framing, data).unwrap().len()));
        });
        group.bench_with_input(BenchmarkId::new("incremental_4k", name), &data, |b, data| {
            b.iter(|| {
                let mut splitter = RowSplitter::new(framing);
                let mut rows = 0usize;
                for buffer in data.chunks(4096) {
                    splitter.push(buffer);
                    while let Some(row) = splitter.next_row().unwrap() {
                        rows += black_box(row.len()).min(1);
                    }
                }
                rows
            });
        });
    }

    group.finish();
}

fn bench_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_rows");

    for (name, codec, framing, data) in [
        ("yson", ControlRowCodec::Yson, RowFraming::YsonListFragment, yson_stream(20_000, 100)),
        ("json", ControlRowCodec::Json, RowFraming::Lines, json_stream(20_000, 100)),
    ] {
        let rows: Vec<Bytes> = split_rows(framing, &data).unwrap();
        group.throughput(Throughput::Elements(rows.len() as u64));
        group.bench_with_input(BenchmarkId::new("classify", name), &rows, |b, rows| {
            b.iter(|| {
                rows.iter()
                    .filter(|row| codec.is_control_row(row).unwrap())
                    .count()
            });
        });
    }

    group.finish();
}

fn bench_chunking(c: &mut Criterion) {
    let data = yson_stream(50_000, usize::MAX);
    let mut group = c.benchmark_group("write_chunks");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for rows_per_chunk in [100u64, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("yson", rows_per_chunk),
            &rows_per_chunk,
            |b, &rows_per_chunk| {
                b.iter(|| {
                    let mut builder = ChunkBuilder::new(&TableFormat::Yson, 128 << 20, rows_per_chunk);
                    for buffer in data.chunks(64 * 1024) {
                        builder.push(buffer).unwrap();
                    }
                    builder.finish().unwrap();
                    let mut chunks = 0;
                    while builder.pop_ready().is_some() {
                        chunks += 1;
                    }
                    black_box(chunks)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_framing, bench_classification, bench_chunking);
criterion_main!(benches);
