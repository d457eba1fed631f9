// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Penumbra Analyzers
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Turns a finalized `GenerationTrace` into an `InsightReport`.
//!
//! Three variants share one `Analyzer` capability:
//!
//! - **entropy**: sliding-window search for high-uncertainty spans.
//! - **reasoning**: per-step quality of delimited reasoning segments.
//! - **vlm**: grounding of generated words in image attention.
//!
//! Every report carries statistically derived scores. Narrative
//! enrichment through an `InsightGenerator` is optional; when it fails
//! the report is still returned with `degraded = true`.

pub mod entropy;
pub mod insight;
pub mod phase;
pub mod profile;
pub mod reasoning;
pub mod report;
pub mod vlm;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use penumbra_core::Embedder;
use penumbra_types::{
    AnalyzerConfig, AttentionPayload, GenerationTrace, ImageInput, InsightReport, PenumbraResult,
    ReasoningDelimiters,
};

pub use entropy::EntropyAnalyzer;
pub use insight::{
    EnrichmentFailure, ExternalInsight, InsightClient, InsightGenerator, InsightPayload,
    InsightRequest, INSIGHT_SCHEMA_VERSION,
};
pub use phase::{AnalysisPhase, PhaseTracker};
pub use profile::EntropyProfile;
pub use reasoning::ReasoningAnalyzer;
pub use report::ReportBuilder;
pub use vlm::VlmAnalyzer;

/// Input an analyzer variant cannot work without.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modality {
    ReasoningDelimiters,
    Image,
    Attention,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Modality::ReasoningDelimiters => "reasoning delimiters",
            Modality::Image => "image",
            Modality::Attention => "attention payload",
        })
    }
}

/// Per-call modality overrides.
///
/// Resolution order: these values, then the ones given at finalize,
/// then the analyzer configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisInputs {
    pub image: Option<ImageInput>,
    pub attention: Option<AttentionPayload>,
    pub delimiters: Option<ReasoningDelimiters>,
}

impl AnalysisInputs {
    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_attention(mut self, attention: AttentionPayload) -> Self {
        self.attention = Some(attention);
        self
    }

    pub fn with_delimiters(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.delimiters = Some(ReasoningDelimiters { start: start.into(), end: end.into() });
        self
    }

    pub(crate) fn resolve_delimiters(
        &self,
        trace: &GenerationTrace,
        config: &AnalyzerConfig,
    ) -> Option<ReasoningDelimiters> {
        self.delimiters
            .clone()
            .or_else(|| trace.delimiters.clone())
            .or_else(|| match (&config.reasoning_start_token, &config.reasoning_end_token) {
                (Some(start), Some(end)) => Some(ReasoningDelimiters {
                    start: start.clone(),
                    end: end.clone(),
                }),
                _ => None,
            })
    }

    pub(crate) fn resolve_image<'a>(&'a self, trace: &'a GenerationTrace) -> Option<&'a ImageInput> {
        self.image.as_ref().or(trace.image.as_ref())
    }

    pub(crate) fn resolve_attention<'a>(
        &'a self,
        trace: &'a GenerationTrace,
    ) -> Option<&'a AttentionPayload> {
        self.attention
            .as_ref()
            .or(trace.attention.as_ref())
            .filter(|a| !a.is_empty())
    }
}

/// Common capability of every analyzer variant.
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Modalities `analyze` fails without.
    fn requires(&self) -> BTreeSet<Modality>;

    /// Analyze a finalized trace.
    ///
    /// Fails with `Sequence` for open, empty or malformed traces and
    /// with `MissingModality` when a required input is absent.
    /// Enrichment failures never surface here.
    fn analyze(&self, trace: &GenerationTrace, inputs: &AnalysisInputs) -> PenumbraResult<InsightReport>;
}

/// Optional collaborators shared by the variants.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub embedder: Option<Arc<dyn Embedder>>,
    pub insight: Option<InsightClient>,
}

impl Capabilities {
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Attach a generator, using `config.insight` (or defaults) for the
    /// deadline and retry policy.
    pub fn with_insight(mut self, config: &AnalyzerConfig, generator: Arc<dyn InsightGenerator>) -> Self {
        let insight_config = config.insight.clone().unwrap_or_default();
        self.insight = Some(InsightClient::new(generator, insight_config));
        self
    }

    /// Run narrative enrichment if a generator is attached.
    pub(crate) fn narrate(
        &self,
        variant: &str,
        trace: &GenerationTrace,
        summary: serde_json::Value,
        builder: &mut ReportBuilder,
    ) -> Option<InsightPayload> {
        let client = self.insight.as_ref()?;
        let request = client.request(variant, trace, summary);
        match client.enrich(&request) {
            Ok(payload) => {
                builder.enrich(&payload);
                Some(payload)
            }
            Err(failure) => {
                builder.enrichment_failed(failure);
                None
            }
        }
    }
}

/// Variant selector for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    Entropy,
    Reasoning,
    Vlm,
}

/// Tagged union over the analyzer variants.
pub enum AnalyzerVariant {
    Entropy(EntropyAnalyzer),
    Reasoning(ReasoningAnalyzer),
    Vlm(VlmAnalyzer),
}

impl AnalyzerVariant {
    pub fn build(
        kind: AnalyzerKind,
        config: AnalyzerConfig,
        capabilities: Capabilities,
    ) -> PenumbraResult<Self> {
        Ok(match kind {
            AnalyzerKind::Entropy => {
                AnalyzerVariant::Entropy(EntropyAnalyzer::new(config)?.with_capabilities(capabilities))
            }
            AnalyzerKind::Reasoning => AnalyzerVariant::Reasoning(
                ReasoningAnalyzer::new(config)?.with_capabilities(capabilities),
            ),
            AnalyzerKind::Vlm => {
                AnalyzerVariant::Vlm(VlmAnalyzer::new(config)?.with_capabilities(capabilities))
            }
        })
    }

    pub fn kind(&self) -> AnalyzerKind {
        match self {
            AnalyzerVariant::Entropy(_) => AnalyzerKind::Entropy,
            AnalyzerVariant::Reasoning(_) => AnalyzerKind::Reasoning,
            AnalyzerVariant::Vlm(_) => AnalyzerKind::Vlm,
        }
    }

    fn inner(&self) -> &dyn Analyzer {
        match self {
            AnalyzerVariant::Entropy(a) => a,
            AnalyzerVariant::Reasoning(a) => a,
            AnalyzerVariant::Vlm(a) => a,
        }
    }
}

impl Analyzer for AnalyzerVariant {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn requires(&self) -> BTreeSet<Modality> {
        self.inner().requires()
    }

    fn analyze(&self, trace: &GenerationTrace, inputs: &AnalysisInputs) -> PenumbraResult<InsightReport> {
        self.inner().analyze(trace, inputs)
    }
}
