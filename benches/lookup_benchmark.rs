//! Benchmarks for the routing hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use routegate::config::{Matcher, Strategy};
use routegate::glob::GlobCache;
use routegate::table::Table;

fn sample_table() -> Table {
    let mut text = String::new();
    for i in 0..100 {
        text.push_str(&format!(
            "route add svc-{} host{}.example.com/ http://10.0.0.{}:80/\n",
            i,
            i,
            i % 250 + 1
        ));
    }
    text.push_str("route add api api.example.com/v1/users http://10.0.1.1:80/\n");
    text.push_str("route add api api.example.com/v1/ http://10.0.1.2:80/\n");
    text.push_str("route add api api.example.com/ http://10.0.1.3:80/\n");
    text.push_str("route add wild *.tenant.example.com/ http://10.0.2.1:80/\n");
    Table::parse(&text).unwrap()
}

fn bench_lookup(c: &mut Criterion) {
    let table = sample_table();
    let glob = GlobCache::new(1000);

    let mut group = c.benchmark_group("lookup");
    group.throughput(Throughput::Elements(1));

    group.bench_function("exact_host", |b| {
        b.iter(|| {
            black_box(table.lookup(
                "host42.example.com",
                "/",
                None,
                None,
                Strategy::RoundRobin,
                Matcher::Prefix,
                &glob,
                false,
            ))
        });
    });

    group.bench_function("path_specificity", |b| {
        b.iter(|| {
            black_box(table.lookup(
                "api.example.com",
                "/v1/users/42",
                None,
                None,
                Strategy::RoundRobin,
                Matcher::Prefix,
                &glob,
                false,
            ))
        });
    });

    group.bench_function("wildcard_host", |b| {
        b.iter(|| {
            black_box(table.lookup(
                "a.tenant.example.com",
                "/",
                None,
                None,
                Strategy::RoundRobin,
                Matcher::Prefix,
                &glob,
                false,
            ))
        });
    });

    group.bench_function("lookup_host", |b| {
        b.iter(|| black_box(table.lookup_host("host7.example.com", Strategy::RoundRobin)));
    });

    group.finish();
}

fn bench_glob_cache(c: &mut Criterion) {
    let cache = GlobCache::new(1000);
    let cold = GlobCache::new(0);

    let mut group = c.benchmark_group("glob");
    group.throughput(Throughput::Elements(1));

    group.bench_function("cached", |b| {
        b.iter(|| black_box(cache.matches("/api/*/users", "/api/v1/users")));
    });

    group.bench_function("uncached", |b| {
        b.iter(|| black_box(cold.matches("/api/*/users", "/api/v1/users")));
    });

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut text = String::new();
    for i in 0..100 {
        text.push_str(&format!(
            "route add svc-{} host{}.example.com/ http://10.0.0.{}:80/ weight 0.5\n",
            i,
            i,
            i % 250 + 1
        ));
    }

    c.bench_function("parse_100_routes", |b| {
        b.iter(|| black_box(Table::parse(&text).unwrap()));
    });
}

criterion_group!(benches, bench_lookup, bench_glob_cache, bench_parse);
criterion_main!(benches);
