//! Performance benchmarks for migration discovery and planning.
//!
//! Discovery parses every bundled asset name and validates the catalog, and
//! runs once per process. Planning runs once per migrate command. Neither is
//! hot, but both sit on the startup path of every binary that opens storage.
//!
//! # Run Benchmarks
//!
//! ```sh
//! # Run all planner benchmarks
//! cargo bench --bench planner_bench
//!
//! # Run a specific benchmark group
//! cargo bench --bench planner_bench -- plan
//!
//! # Compare against a saved baseline
//! cargo bench --bench planner_bench -- --save-baseline before
//! cargo bench --bench planner_bench -- --baseline before
//! ```

use bulwark_core::{Dialect, MigrationTarget, SchemaVersion};
use bulwark_storage::catalog::{BUNDLED_ASSETS, parse_migration_name};
use bulwark_storage::{Catalog, Queries, planner};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

/// Benchmark full catalog discovery over the bundled assets.
fn bench_discover(c: &mut Criterion) {
    let mut group = c.benchmark_group("discover");
    group.throughput(Throughput::Elements(BUNDLED_ASSETS.len() as u64));

    group.bench_function("bundled", |b| {
        b.iter(|| black_box(Catalog::discover(black_box(BUNDLED_ASSETS))))
    });

    group.bench_function("parse_name", |b| {
        b.iter(|| {
            black_box(parse_migration_name(
                black_box("V0003.WebAuthn_Credentials.postgres.up.sql"),
                "",
            ))
        })
    });

    group.finish();
}

/// Benchmark planning across the interesting starting points.
fn bench_plan(c: &mut Criterion) {
    let catalog = match Catalog::discover(BUNDLED_ASSETS) {
        Ok(catalog) => catalog,
        Err(e) => panic!("bundled catalog is invalid: {e}"),
    };

    let mut group = c.benchmark_group("plan");
    group.throughput(Throughput::Elements(1));

    let cases = [
        ("empty_to_latest", SchemaVersion::EMPTY, MigrationTarget::Latest),
        ("pre1_to_latest", SchemaVersion::PRE1, MigrationTarget::Latest),
        (
            "latest_to_empty",
            SchemaVersion::new(4),
            MigrationTarget::Version(SchemaVersion::EMPTY),
        ),
    ];

    for dialect in Dialect::ALL {
        for (name, prior, target) in cases {
            group.bench_with_input(
                BenchmarkId::new(dialect.as_str(), name),
                &(prior, target),
                |b, &(prior, target)| {
                    b.iter(|| black_box(planner::plan(&catalog, dialect, black_box(prior), target)))
                },
            );
        }
    }

    group.finish();
}

/// Benchmark building the per-dialect statement set.
fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");

    for dialect in Dialect::ALL {
        group.bench_function(dialect.as_str(), |b| b.iter(|| black_box(Queries::new(black_box(dialect)))));
    }

    group.finish();
}

criterion_group!(benches, bench_discover, bench_plan, bench_queries);
criterion_main!(benches);
