// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for the span hot path.
//!
//! - Span start/finish with and without sampling
//! - Attribute and event recording
//! - Jaeger projection and serialization
//!
//! Run with: `cargo bench --bench span`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use medtrace::attributes;
use medtrace::config::TelemetryConfiguration;
use medtrace::telemetry::{
    JaegerBatch, MemoryExporter, NullResourceReader, PerformanceProfiler, SpanData, SpanKind,
    TelemetrySystem, TraceContext,
};

fn system(sampling_rate: f64, profiling: bool) -> TelemetrySystem {
    TelemetrySystem::with_components(
        TelemetryConfiguration::for_service("bench")
            .with_sampling_rate(sampling_rate)
            .with_profiling(profiling)
            .with_max_spans(10_000),
        Arc::new(PerformanceProfiler::new(Arc::new(NullResourceReader))),
        Arc::new(MemoryExporter::new()),
    )
}

/// Benchmark span start + finish.
fn bench_span_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("span_lifecycle");

    for (label, rate, profiling) in [
        ("sampled", 1.0, false),
        ("sampled_profiled", 1.0, true),
        ("unsampled", 0.0, false),
    ] {
        let telemetry = system(rate, profiling);
        group.bench_function(label, |b| {
            b.iter(|| {
                telemetry.set_current_context(None);
                let span = telemetry.start_span("op", SpanKind::Internal, None, None);
                telemetry.finish_span(black_box(&span));
            });
        });
    }

    group.finish();
}

/// Benchmark attribute and event recording.
fn bench_span_recording(c: &mut Criterion) {
    let mut group = c.benchmark_group("span_recording");
    let telemetry = system(1.0, false);

    group.bench_function("set_attribute", |b| {
        let span = telemetry.span("attrs");
        b.iter(|| span.set_attribute(black_box("http.status_code"), 200));
    });

    group.bench_function("add_event", |b| {
        let span = telemetry.span("events");
        b.iter(|| span.add_event_with("retry", attributes! { "attempt" => 2 }));
    });

    group.bench_function("trace_context_child", |b| {
        let root = TraceContext::new_root();
        b.iter(|| black_box(root.child()));
    });

    group.finish();
}

/// Benchmark projection into the Jaeger wire shape.
fn bench_jaeger_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("jaeger_projection");

    for size in [10usize, 100, 1000] {
        let spans: Vec<SpanData> = (0..size)
            .map(|i| {
                let mut data =
                    SpanData::new(format!("op-{i}"), TraceContext::new_root(), SpanKind::Server, None);
                data.set_attributes(attributes! {
                    "http.method" => "GET",
                    "http.status_code" => 200,
                    "db.rows" => vec![1i64, 2, 3],
                });
                data.add_event("cache_miss");
                data.end();
                data
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("serialize", size), &spans, |b, spans| {
            b.iter(|| {
                let batch =
                    JaegerBatch::new(spans.iter().map(|s| s.to_jaeger_format("bench")).collect());
                black_box(serde_json::to_vec(&batch))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_span_lifecycle,
    bench_span_recording,
    bench_jaeger_projection
);
criterion_main!(benches);
