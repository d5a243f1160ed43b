//! Dispatch throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use herald::{
    DefaultTransformer, DeliveryEndpoint, FilterEngine, Payload, RegexPredicateCompiler, Result,
    SubscribeOptions, Subscription,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CountingEndpoint {
    delivered: AtomicU64,
}

impl DeliveryEndpoint for CountingEndpoint {
    fn deliver(&self, _payload: &Payload, _raw: bool) -> Result<()> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn effective_location(&self) -> String {
        "bench:counting".to_string()
    }

    fn destroy(&self) {}
}

fn engine_with_rules(rules: usize, filtered: bool) -> FilterEngine {
    let engine = FilterEngine::new(
        Arc::new(RegexPredicateCompiler),
        Arc::new(DefaultTransformer::new()),
    );
    let endpoint = Arc::new(CountingEndpoint::default());

    for i in 0..rules {
        let mut options = SubscribeOptions::new("bench");
        if filtered {
            options = options.with_filter(format!("\"sensor\":\"s{}\"", i), None);
        }
        let sub = Subscription::new(format!("sub-{}", i), options, endpoint.clone());
        engine.register(&sub, endpoint.clone()).unwrap();
    }

    engine
}

/// One event against a growing rule set where exactly one rule matches.
fn bench_selective_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("selective_dispatch");

    for rules in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("rules", rules), &rules, |b, &rules| {
            let engine = engine_with_rules(rules, true);
            let event = json!({"sensor": "s7", "temp": 21.5}).to_string();

            b.iter(|| black_box(engine.filter_message(black_box(event.clone()).into())));
        });
    }

    group.finish();
}

/// Every rule matches: dominated by delivery fan-out.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for rules in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("rules", rules), &rules, |b, &rules| {
            let engine = engine_with_rules(rules, false);

            b.iter(|| black_box(engine.filter_message(black_box("plain event").into())));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_selective_dispatch, bench_fanout);
criterion_main!(benches);
