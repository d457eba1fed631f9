// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Penumbra Uncertainty Kernel Types
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Type definitions, configuration, report schema and error hierarchy
//! for Penumbra, token-level uncertainty quantification for generative
//! models.

pub mod config;
pub mod error;
pub mod report;
pub mod token;
pub mod trace;

pub use config::{AnalyzerConfig, CaptureConfig, ClusteringMode, InsightConfig, RetryConfig, VlmConfig};
pub use error::{PenumbraError, PenumbraResult};
pub use report::{clamp_score, EnrichmentStatus, InsightReport, Scores};
pub use token::{ClusterPartition, SemanticCluster, TokenCandidate, TokenMetrics, TopKDistribution};
pub use trace::{
    AttentionPayload, GenerationTrace, ImageInput, ImageRegion, ReasoningDelimiters, StepAttention,
    TextSpan, TracePhase, TraceSummary,
};
