//! Adaptive WAF Performance Benchmarks
//!
//! Covers the classification hot path: keyword rules, rate windows, anomaly
//! scoring and the full classifier over an in-memory store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

use zentinel_adaptive_waf::config::KeywordConfig;
use zentinel_adaptive_waf::ml::{FeatureVector, IsolationForest, ModelArtifact, FEATURE_COUNT};
use zentinel_adaptive_waf::{
    AnomalyScorer, KeywordRules, MemoryBackend, RequestClassifier, RequestDescriptor, RiskScorer,
    WafConfig,
};

/// Representative request paths
fn generate_paths() -> Vec<(&'static str, &'static str)> {
    vec![
        ("root", "/"),
        ("benign_short", "/catalog/42"),
        ("benign_deep", "/blog/2024/05/rust-async-patterns/comments?page=3"),
        ("allowed", "/profile/settings/"),
        ("exempt_keyword", "/static/css/site.css"),
        ("malicious_simple", "/wp-login.php"),
        ("malicious_encoded", "/cgi-bin/%2e%65nv"),
        ("malicious_deep", "/assets/vendor/phpunit/src/Util/PHP/eval-stdin.php"),
    ]
}

fn training_samples(n: usize, rng: &mut StdRng) -> Vec<FeatureVector> {
    (0..n)
        .map(|_| {
            let mut v = [0.0; FEATURE_COUNT];
            v[0] = rng.gen_range(1.0..30.0);
            v[1] = rng.gen_range(1.0..10.0);
            v[5] = rng.gen_range(5.0..25.0);
            v
        })
        .collect()
}

/// Benchmark path classification
fn benchmark_keyword_rules(c: &mut Criterion) {
    let rules = KeywordRules::from_config(&KeywordConfig::default())
        .with_dynamic(["boaform", "luci", "stok", "hnap1", "setup"]);
    let mut group = c.benchmark_group("keyword_rules");

    for (name, path) in generate_paths() {
        group.throughput(Throughput::Bytes(path.len() as u64));
        group.bench_with_input(BenchmarkId::new("classify", name), path, |b, path| {
            b.iter(|| black_box(rules.classify(black_box(path))))
        });
    }

    group.finish();
}

/// Benchmark anomaly scoring at different forest sizes
fn benchmark_anomaly_scoring(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let samples = training_samples(2048, &mut rng);
    let window: FeatureVector = [120.0, 60.0, 8.0, 3.0, 1.0, 40.0];
    let mut group = c.benchmark_group("anomaly_scoring");

    for trees in [50usize, 100, 200] {
        let forest = IsolationForest::train(&samples, trees, 256, &mut rng);
        let scorer = AnomalyScorer::new();
        scorer.install(ModelArtifact::new(forest, 1, samples.len()));

        group.bench_with_input(BenchmarkId::new("trees", trees), &window, |b, window| {
            b.iter(|| black_box(scorer.score(black_box(window))))
        });
    }

    group.bench_function("train_100x256", |b| {
        b.iter(|| black_box(IsolationForest::train(&samples, 100, 256, &mut rng)))
    });

    group.finish();
}

/// Benchmark the full classifier
fn benchmark_classify(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = WafConfig::default();

    let mut rng = StdRng::seed_from_u64(7);
    let samples = training_samples(1024, &mut rng);
    let scorer = Arc::new(AnomalyScorer::new());
    scorer.install(ModelArtifact::new(
        IsolationForest::train(&samples, 100, 256, &mut rng),
        1,
        samples.len(),
    ));

    let classifier = RequestClassifier::new(
        Arc::new(config),
        Arc::new(MemoryBackend::new()),
        scorer,
    );
    rt.block_on(classifier.blacklist().add("192.0.2.1", "bench"))
        .unwrap();
    let counter = AtomicU64::new(0);
    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Elements(1));

    group.bench_function("benign_many_clients", |b| {
        b.to_async(&rt).iter(|| async {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            let identity = format!("10.{}.{}.{}", (n >> 16) & 255, (n >> 8) & 255, n & 255);
            let request = RequestDescriptor::new(identity, "/catalog/42");
            black_box(classifier.classify(&request).await)
        })
    });

    group.bench_function("blacklisted_client", |b| {
        b.to_async(&rt).iter(|| async {
            let request = RequestDescriptor::new("192.0.2.1", "/blog/2024/05/post");
            black_box(classifier.classify(&request).await)
        })
    });

    group.bench_function("malicious_path", |b| {
        b.to_async(&rt).iter(|| async {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            let identity = format!("203.0.{}.{}", (n >> 8) & 255, n & 255);
            let request = RequestDescriptor::new(identity, "/.env");
            black_box(classifier.classify(&request).await)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_keyword_rules,
    benchmark_anomaly_scoring,
    benchmark_classify,
);
criterion_main!(benches);
