//! Expression and extent benchmarks.

use cirrina_core::{Context, Expression, Extent, InMemoryContext};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("expression_compile");

    for (name, source) in [
        ("literal", "42"),
        ("arithmetic", "a + b * (c - 1) / 2"),
        ("guard", "count < 100 && !done || retries >= 3"),
        ("object", "{\"x\": [1, 2, 3], \"y\": \"text\"}"),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &source, |b, source| {
            b.iter(|| black_box(Expression::new(*source).unwrap()))
        });
    }

    group.finish();
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("expression_evaluate");

    let mut scope: Map<String, Value> = Map::new();
    scope.insert("a".to_string(), json!(7));
    scope.insert("b".to_string(), json!(3));
    scope.insert("c".to_string(), json!(5));
    scope.insert("count".to_string(), json!(10));
    scope.insert("done".to_string(), json!(false));
    scope.insert("retries".to_string(), json!(0));

    let arithmetic = Expression::new("a + b * (c - 1) / 2").unwrap();
    group.bench_function("arithmetic", |b| {
        b.iter(|| black_box(arithmetic.evaluate(&scope).unwrap()))
    });

    let guard = Expression::new("count < 100 && !done || retries >= 3").unwrap();
    group.bench_function("guard", |b| {
        b.iter(|| black_box(guard.evaluate(&scope).unwrap()))
    });

    group.finish();
}

fn bench_extent_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("extent_resolve");

    for depth in [1usize, 3, 8] {
        let bottom = InMemoryContext::new();
        bottom.create("counter", json!(0)).unwrap();
        let mut extent = Extent::new(Arc::new(bottom));
        for layer in 1..depth {
            let context = InMemoryContext::new();
            context.create(&format!("v{}", layer), json!(layer)).unwrap();
            extent = extent.extend(Arc::new(context));
        }
        let increment = Expression::new("counter + 1").unwrap();

        group.bench_with_input(BenchmarkId::new("increment", depth), &extent, |b, extent| {
            b.iter(|| {
                let value = increment.evaluate(extent).unwrap();
                extent.try_set("counter", black_box(value)).unwrap();
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_evaluate, bench_extent_resolve);
criterion_main!(benches);
