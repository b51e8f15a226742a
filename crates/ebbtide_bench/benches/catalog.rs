//! Partition catalog benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ebbtide_bench::{daily_boundaries, EPOCH};
use ebbtide_core::{
    CompressionPolicy, Manifest, PartitionCatalog, RetentionPolicy, TierConfig,
};
use ebbtide_storage::{PartitionKey, TableStructure, TierId};

fn catalog_with(boundaries: &[PartitionKey]) -> PartitionCatalog {
    let mut catalog = PartitionCatalog::new(TierId(1));
    for &boundary in boundaries {
        catalog.split(boundary).unwrap();
    }
    catalog
}

/// Benchmark appending boundaries to a catalog.
fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("catalog_split");

    for count in [30u32, 365, 3650].iter() {
        group.throughput(Throughput::Elements(u64::from(*count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let boundaries = daily_boundaries(count);
            b.iter(|| {
                let catalog = catalog_with(black_box(&boundaries));
                black_box(catalog);
            });
        });
    }
    group.finish();
}

/// Benchmark removing the oldest boundary until none remain.
fn bench_merge_oldest(c: &mut Criterion) {
    let mut group = c.benchmark_group("catalog_merge_oldest");

    for count in [30u32, 365].iter() {
        group.throughput(Throughput::Elements(u64::from(*count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let template = catalog_with(&daily_boundaries(count));
            b.iter(|| {
                let mut catalog = template.clone();
                while let Some(boundary) = catalog.oldest_boundary() {
                    catalog.merge(boundary).unwrap();
                }
                black_box(catalog);
            });
        });
    }
    group.finish();
}

/// Benchmark routing a key to its partition.
fn bench_partition_for(c: &mut Criterion) {
    let mut group = c.benchmark_group("catalog_partition_for");

    for count in [30u32, 365, 3650].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let catalog = catalog_with(&daily_boundaries(count));
            let key = PartitionKey::new(EPOCH.as_i64() + i64::from(count / 2) * 86_400 + 3_600);
            b.iter(|| {
                let partition = catalog.partition_for(black_box(key));
                black_box(partition.id);
            });
        });
    }
    group.finish();
}

/// Benchmark taking a snapshot and validating it.
fn bench_snapshot_validate(c: &mut Criterion) {
    let catalog = catalog_with(&daily_boundaries(365));

    c.bench_function("catalog_snapshot", |b| {
        b.iter(|| black_box(catalog.partitions()));
    });

    c.bench_function("catalog_validate", |b| {
        b.iter(|| catalog.validate().unwrap());
    });
}

/// Benchmark manifest encoding and decoding.
fn bench_manifest(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest");

    for count in [30u32, 365].iter() {
        let catalog = catalog_with(&daily_boundaries(*count));
        let manifest = Manifest::new(
            &catalog,
            TierConfig::default(),
            CompressionPolicy::default(),
            RetentionPolicy::default(),
            TableStructure::default(),
        );
        let encoded = manifest.encode().unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &manifest, |b, manifest| {
            b.iter(|| black_box(manifest.encode().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &encoded, |b, encoded| {
            b.iter(|| black_box(Manifest::decode(black_box(encoded)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_split,
    bench_merge_oldest,
    bench_partition_for,
    bench_snapshot_validate,
    bench_manifest,
);
criterion_main!(benches);
