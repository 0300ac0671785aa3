//! Sync cursor paging benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshdb_bench::utils::{generate_store, ALL_TIME};
use meshdb_codec::{Decode, Encode};
use meshdb_core::{
    ContinueToken, CursorConfig, DataSizeSpec, SyncDataReader, SyncQuery, SyncTimeRange,
};

const MIB: usize = 1024 * 1024;

/// Read every page of a request, returning the item count.
fn drain(reader: &SyncDataReader, first: meshdb_core::SyncPage, spec: DataSizeSpec) -> usize {
    let mut page = first;
    let mut total = page.items.len();
    while let Some(token) = page.token.take() {
        page = reader.get_sync_data_next(token, spec).unwrap();
        total += page.items.len();
    }
    total
}

/// Benchmark a full sync at various page sizes.
fn bench_full_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_sync");
    let count = 10_000;
    let reader = SyncDataReader::new(generate_store(count, 64, count / 4), CursorConfig::default());
    group.throughput(Throughput::Elements(count as u64));

    for packet in [50, 500, 5000] {
        group.bench_with_input(BenchmarkId::from_parameter(packet), &packet, |b, &packet| {
            let spec = DataSizeSpec::new(MIB, packet);
            b.iter(|| {
                let first = reader.get_sync_data(0, ALL_TIME, spec).unwrap();
                black_box(drain(&reader, first, spec));
            });
        });
    }

    group.finish();
}

/// Benchmark query syncs, key-only and with a value filter.
fn bench_query_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_sync");
    let count = 10_000;
    let reader = SyncDataReader::new(generate_store(count, 64, count / 4), CursorConfig::default());
    let spec = DataSizeSpec::new(MIB, 500);
    group.throughput(Throughput::Elements(count as u64));

    group.bench_function("key_prefix", |b| {
        b.iter(|| {
            let first = reader
                .get_sync_data_by_query(
                    SyncQuery::prefix("key_0000"),
                    SyncTimeRange::both(0, ALL_TIME),
                    spec,
                )
                .unwrap();
            black_box(drain(&reader, first, spec));
        });
    });

    group.bench_function("value_filter", |b| {
        b.iter(|| {
            let first = reader
                .get_sync_data_by_query(
                    SyncQuery::all().value_contains(vec![0xAB]),
                    SyncTimeRange::both(0, ALL_TIME),
                    spec,
                )
                .unwrap();
            black_box(drain(&reader, first, spec));
        });
    });

    group.finish();
}

/// Benchmark continue token encoding.
fn bench_token_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("continue_token");
    let reader = SyncDataReader::new(generate_store(1000, 16, 100), CursorConfig::default());
    let spec = DataSizeSpec::new(MIB, 10);
    let token = reader
        .get_sync_data_by_query(SyncQuery::prefix("key_"), SyncTimeRange::both(0, ALL_TIME), spec)
        .unwrap()
        .token
        .unwrap();
    let bytes = token.to_parcel().unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(black_box(&token).to_parcel().unwrap()));
    });

    group.bench_function("decode", |b| {
        b.iter(|| black_box(ContinueToken::from_parcel(black_box(&bytes)).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_full_sync, bench_query_sync, bench_token_codec);
criterion_main!(benches);
