// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Uncertainty Estimator (Host Push Interface)
// ─────────────────────────────────────────────────────────────────────
//! Entry point for the host's decoding loop.
//!
//! The host pushes one `StepInput` per generated token and finalizes
//! when generation ends. The kernel never calls back into the host.
//!
//! `UncertaintyEstimator` is immutable and shareable across threads;
//! each generation gets its own `TraceSession` from `begin()`, so
//! batched or parallel requests never share a trace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use penumbra_types::{
    CaptureConfig, ClusteringMode, GenerationTrace, PenumbraError, PenumbraResult, TokenMetrics,
    TopKDistribution, TracePhase, TraceSummary,
};

use crate::capture::{capture, RawScores};
use crate::cluster::SemanticClusterer;
use crate::embedder::Embedder;
use crate::entropy::{raw_entropy, semantic_entropy};
use crate::trace::{FinalizeRequest, TraceAggregator};

/// One generated token as reported by the host.
///
/// Serialisable so out-of-process hosts can stream steps as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub step_index: usize,
    pub scores: RawScores,
    /// Attention from this token to the image patches (VLM only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention: Option<Vec<f32>>,
    /// Token actually emitted; defaults to the top candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_token: Option<String>,
}

impl StepInput {
    pub fn new(step_index: usize, scores: RawScores) -> Self {
        Self { step_index, scores, attention: None, chosen_token: None }
    }

    pub fn with_attention(mut self, weights: Vec<f32>) -> Self {
        self.attention = Some(weights);
        self
    }

    pub fn with_chosen(mut self, token: impl Into<String>) -> Self {
        self.chosen_token = Some(token.into());
        self
    }
}

/// Shareable flag the host can flip from another thread to stop capture.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capture configuration plus embedding capability.
#[derive(Clone)]
pub struct UncertaintyEstimator {
    config: CaptureConfig,
    embedder: Option<Arc<dyn Embedder>>,
}

impl UncertaintyEstimator {
    pub fn new(config: CaptureConfig) -> PenumbraResult<Self> {
        config.validate()?;
        Ok(Self { config, embedder: None })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Start an isolated trace for one generation.
    pub fn begin(&self) -> TraceSession {
        TraceSession {
            config: self.config.clone(),
            clusterer: SemanticClusterer::new(
                self.config.semantic_similarity_threshold,
                self.embedder.clone(),
            ),
            aggregator: TraceAggregator::from_config(&self.config),
            pending: Vec::new(),
            cancel: CancelHandle::default(),
        }
    }
}

/// Step captured in `AtFinalize` mode, waiting for clustering.
struct PendingStep {
    distribution: TopKDistribution,
    chosen_token: String,
    attention: Option<Vec<f32>>,
}

/// Single-writer capture session for one generation.
pub struct TraceSession {
    config: CaptureConfig,
    clusterer: SemanticClusterer,
    aggregator: TraceAggregator,
    pending: Vec<PendingStep>,
    cancel: CancelHandle,
}

impl TraceSession {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn phase(&self) -> TracePhase {
        self.aggregator.phase()
    }

    /// Steps accepted so far, clustered or pending.
    pub fn len(&self) -> usize {
        self.aggregator.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Running aggregates. In `AtFinalize` mode pending steps are not
    /// counted until finalize.
    pub fn summary(&self) -> TraceSummary {
        self.aggregator.summary()
    }

    /// Capture, score and record one step.
    ///
    /// An `InvalidDistribution` rejects only this step; the index is not
    /// consumed, so the host may retry it.
    pub fn ingest_step(&mut self, input: StepInput) -> PenumbraResult<()> {
        self.check_open(input.step_index)?;
        let distribution = capture(
            input.step_index,
            &input.scores,
            self.config.top_k,
            self.config.min_token_prob,
        )?;
        self.push_distribution(distribution, input.chosen_token, input.attention)
    }

    /// Record a distribution the host captured itself (e.g. through
    /// `capture_dense`).
    pub fn ingest_distribution(
        &mut self,
        distribution: TopKDistribution,
        chosen_token: Option<String>,
        attention: Option<Vec<f32>>,
    ) -> PenumbraResult<()> {
        self.check_open(distribution.step_index)?;
        distribution.validate()?;
        if distribution.len() > self.config.top_k {
            return Err(PenumbraError::InvalidDistribution(format!(
                "step {}: {} candidates exceed top_k {}",
                distribution.step_index,
                distribution.len(),
                self.config.top_k
            )));
        }
        self.push_distribution(distribution, chosen_token, attention)
    }

    fn check_open(&self, step_index: usize) -> PenumbraResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PenumbraError::Sequence(format!(
                "ingest of step {step_index} after cancellation"
            )));
        }
        if self.pending.is_empty() {
            return self.aggregator.check_next(step_index);
        }
        let expected = self.aggregator.next_step_index() + self.pending.len();
        if step_index != expected {
            return Err(PenumbraError::Sequence(format!(
                "expected step {expected}, got {step_index}"
            )));
        }
        Ok(())
    }

    fn push_distribution(
        &mut self,
        distribution: TopKDistribution,
        chosen_token: Option<String>,
        attention: Option<Vec<f32>>,
    ) -> PenumbraResult<()> {
        let chosen_token = match chosen_token {
            Some(t) => t,
            None => distribution
                .top()
                .map(|c| c.text.clone())
                .unwrap_or_default(),
        };
        match self.config.clustering {
            ClusteringMode::PerStep => {
                let metrics = self.score(distribution, chosen_token);
                self.aggregator.ingest_with_attention(metrics, attention)
            }
            ClusteringMode::AtFinalize => {
                self.pending.push(PendingStep { distribution, chosen_token, attention });
                Ok(())
            }
        }
    }

    fn score(&self, distribution: TopKDistribution, chosen_token: String) -> TokenMetrics {
        let partition = self.clusterer.cluster(&distribution);
        TokenMetrics {
            step_index: distribution.step_index,
            raw_entropy: raw_entropy(&distribution),
            semantic_entropy: semantic_entropy(&partition),
            chosen_token,
            distribution,
            partition,
        }
    }

    fn drain_pending(&mut self) -> PenumbraResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        log::debug!("clustering {} deferred steps", self.pending.len());
        for step in std::mem::take(&mut self.pending) {
            let metrics = self.score(step.distribution, step.chosen_token);
            self.aggregator.ingest_with_attention(metrics, step.attention)?;
        }
        Ok(())
    }

    /// Close the trace. Marks it truncated when the cancel handle fired.
    pub fn finalize(&mut self, request: FinalizeRequest) -> PenumbraResult<GenerationTrace> {
        self.drain_pending()?;
        if self.cancel.is_cancelled() {
            log::info!("generation cancelled after {} steps", self.aggregator.len());
            self.aggregator.cancel(request)
        } else {
            self.aggregator.finalize(request)
        }
    }

    /// Cancel and finalize in one call.
    pub fn cancel(&mut self, request: FinalizeRequest) -> PenumbraResult<GenerationTrace> {
        self.cancel.cancel();
        self.finalize(request)
    }
}
