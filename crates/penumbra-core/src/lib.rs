// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Penumbra Uncertainty Core
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Per-step uncertainty capture for generative models: distribution
//! capture, raw and semantic entropy, semantic clustering of candidate
//! tokens, and trace aggregation.
//!
//! The host drives everything. It pushes one step per generated token
//! into a `TraceSession` and finalizes when generation ends; the core
//! never calls back into the model.
//!
//! # Invariants
//!
//! 1. **Mass is conserved**: every captured distribution satisfies
//!    `Σ candidates + residual = 1` within `1e-6`, and every cluster
//!    partition covers each candidate exactly once.
//!
//! 2. **Semantic ≤ raw**: merging candidates into clusters can only
//!    lower entropy. Equality holds iff all clusters are singletons,
//!    which is also the fallback when no embedder is available.
//!
//! 3. **Steps are strictly ordered**: a trace accepts step `n` only
//!    after step `n - 1`; nothing is accepted once it is finalized.
//!
//! 4. **Determinism**: identical inputs (and embedder outputs) produce
//!    identical traces.

pub mod capture;
pub mod cluster;
pub mod embedder;
pub mod entropy;
pub mod estimator;
pub mod trace;

pub use capture::{capture, capture_dense, RawScores, ScoreKind, ScoredToken};
pub use cluster::{cluster, cluster_with_embeddings, SemanticClusterer};
pub use embedder::{
    cosine_similarity, similarity_to_unit, CachedEmbedder, Embedder, ExternalEmbedder,
    NgramEmbedder,
};
pub use entropy::{max_entropy, normalized, raw_entropy, semantic_entropy};
pub use estimator::{CancelHandle, StepInput, TraceSession, UncertaintyEstimator};
pub use trace::{align_tokens, FinalizeRequest, TraceAggregator};
