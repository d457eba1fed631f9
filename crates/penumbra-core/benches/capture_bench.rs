// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Penumbra Capture Benchmarks
// ─────────────────────────────────────────────────────────────────────
//! Criterion benchmarks for the per-step hot path: capture over a full
//! vocabulary, clustering, and a complete session.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use penumbra_core::{
    capture_dense, raw_entropy, semantic_entropy, CachedEmbedder, FinalizeRequest, NgramEmbedder,
    RawScores, ScoreKind, SemanticClusterer, StepInput, UncertaintyEstimator,
};
use penumbra_types::CaptureConfig;

const VOCAB: usize = 32_000;

fn logits(seed: usize) -> Vec<f64> {
    (0..VOCAB)
        .map(|i| (((i * 7919 + seed * 104_729) % 1000) as f64) / 100.0)
        .collect()
}

fn words() -> Vec<String> {
    (0..VOCAB).map(|i| format!("tok{}", i % 997)).collect()
}

// ── capture_dense() ─────────────────────────────────────────────────

fn bench_capture_dense_top10(c: &mut Criterion) {
    let values = logits(1);
    c.bench_function("capture_dense_32k_top10", |b| {
        b.iter(|| {
            capture_dense(0, ScoreKind::Logits, black_box(&values), 10, 0.0, |id| {
                id.to_string()
            })
        })
    });
}

fn bench_capture_dense_top100(c: &mut Criterion) {
    let values = logits(2);
    c.bench_function("capture_dense_32k_top100", |b| {
        b.iter(|| {
            capture_dense(0, ScoreKind::Logits, black_box(&values), 100, 0.01, |id| {
                id.to_string()
            })
        })
    });
}

// ── Clustering + entropy ────────────────────────────────────────────

fn bench_cluster_top20(c: &mut Criterion) {
    let vocab = words();
    let values = logits(3);
    let dist = capture_dense(0, ScoreKind::Logits, &values, 20, 0.0, |id| {
        vocab[id as usize].clone()
    })
    .unwrap();
    let clusterer = SemanticClusterer::new(
        0.8,
        Some(Arc::new(CachedEmbedder::new(Arc::new(NgramEmbedder::default()), 4096))),
    );
    c.bench_function("cluster_top20", |b| {
        b.iter(|| {
            let partition = clusterer.cluster(black_box(&dist));
            (raw_entropy(&dist), semantic_entropy(&partition))
        })
    });
}

// ── Full session ────────────────────────────────────────────────────

fn bench_session_100_steps(c: &mut Criterion) {
    let estimator = UncertaintyEstimator::new(CaptureConfig {
        top_k: 10,
        ..Default::default()
    })
    .unwrap()
    .with_embedder(Arc::new(NgramEmbedder::default()));
    let steps: Vec<RawScores> = (0..100)
        .map(|s| RawScores::logits((0..50).map(|i| (format!("w{}", (i + s) % 60), -(i as f64) * 0.2))))
        .collect();

    c.bench_function("session_100_steps", |b| {
        b.iter(|| {
            let mut session = estimator.begin();
            for (i, scores) in steps.iter().enumerate() {
                session.ingest_step(StepInput::new(i, scores.clone())).unwrap();
            }
            session.finalize(FinalizeRequest::new("prompt", "text")).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_capture_dense_top10,
    bench_capture_dense_top100,
    bench_cluster_top20,
    bench_session_100_steps,
);
criterion_main!(benches);
