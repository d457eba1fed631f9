// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Entropy Analyzer
// ─────────────────────────────────────────────────────────────────────
//! Standard uncertainty report: where in the output the model was
//! unsure, and how far raw entropy overstated that uncertainty because
//! candidates were paraphrases of each other.

use std::collections::BTreeSet;
use std::sync::Arc;

use penumbra_types::{AnalyzerConfig, GenerationTrace, InsightReport, PenumbraResult};

use crate::insight::InsightGenerator;
use crate::phase::run_analysis;
use crate::profile::{competing_candidates, flag_windows, EntropyProfile, FlaggedSpan};
use crate::report::ReportBuilder;
use crate::{AnalysisInputs, Analyzer, Capabilities, Modality};

/// Candidates quoted when explaining a flagged span.
const QUOTED_CANDIDATES: usize = 3;

pub struct EntropyAnalyzer {
    config: AnalyzerConfig,
    caps: Capabilities,
}

impl EntropyAnalyzer {
    pub fn new(config: AnalyzerConfig) -> PenumbraResult<Self> {
        config.validate()?;
        Ok(Self { config, caps: Capabilities::default() })
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_insight(mut self, generator: Arc<dyn InsightGenerator>) -> Self {
        self.caps = self.caps.with_insight(&self.config, generator);
        self
    }

    fn report(&self, trace: &GenerationTrace) -> InsightReport {
        let profile = EntropyProfile::from_trace(trace);
        let mut builder = ReportBuilder::new(profile.base_scores());
        let spans = describe_uncertainty(trace, &profile, &self.config, &mut builder);

        if !spans.is_empty() {
            builder.suggestion(
                "review the flagged spans",
                "verify these passages against a trusted source or re-generate them with more context",
            );
        }
        if profile.overall_uncertainty() > self.config.window_threshold {
            builder.suggestion(
                "reduce overall uncertainty",
                "add grounding context to the prompt or lower the sampling temperature",
            );
        }

        let summary = summary_json(trace, &profile, &spans);
        self.caps.narrate(self.name(), trace, summary, &mut builder);
        builder.build()
    }
}

impl Analyzer for EntropyAnalyzer {
    fn name(&self) -> &'static str {
        "entropy"
    }

    fn requires(&self) -> BTreeSet<Modality> {
        BTreeSet::new()
    }

    fn analyze(&self, trace: &GenerationTrace, _inputs: &AnalysisInputs) -> PenumbraResult<InsightReport> {
        run_analysis(self.name(), trace, || Ok(self.report(trace)))
    }
}

/// Flag high-uncertainty spans and whole-trace issues.
///
/// Shared by all variants; returns the flagged spans.
pub(crate) fn describe_uncertainty(
    trace: &GenerationTrace,
    profile: &EntropyProfile,
    config: &AnalyzerConfig,
    builder: &mut ReportBuilder,
) -> Vec<FlaggedSpan> {
    let spans = flag_windows(&profile.normalized, config.window_size, config.window_threshold);
    for span in &spans {
        let text = trace.text_for_steps(span.first, span.last);
        let why = format!(
            "mean normalised semantic entropy {:.2} over steps {}-{} (window threshold {:.2}); \
             at step {} the model weighed {}",
            span.mean,
            span.first,
            span.last,
            config.window_threshold,
            span.peak_step,
            competing_candidates(&trace.steps[span.peak_step], QUOTED_CANDIDATES),
        );
        builder.uncertain_part(text.trim(), why);
    }

    let summary = &trace.summary;
    if trace.truncated {
        builder.issue(
            "generation was cancelled",
            format!("the trace stops after {} steps; later text was never scored", summary.steps),
        );
    }
    if summary.fallback_steps > 0 {
        builder.issue(
            "semantic clustering unavailable",
            format!(
                "{} of {} steps fell back to singleton clusters, so semantic entropy equals raw entropy there",
                summary.fallback_steps, summary.steps
            ),
        );
    }
    if !summary.collapse_steps.is_empty() {
        builder.issue(
            "raw entropy overstates uncertainty",
            format!(
                "at {} of {} steps the competing candidates were paraphrases (mean raw {:.3} vs semantic {:.3} nats)",
                summary.collapse_steps.len(),
                summary.steps,
                summary.mean_raw_entropy,
                summary.mean_semantic_entropy
            ),
        );
    }
    if let Some(peak) = profile.peak_step.filter(|_| profile.peak > config.window_threshold) {
        builder.issue(
            "uncertainty peak",
            format!(
                "step {peak} ({:?}) reached normalised semantic entropy {:.2}",
                trace.steps[peak].chosen_token, profile.peak
            ),
        );
    }
    spans
}

/// Structural findings handed to the insight generator.
pub(crate) fn summary_json(
    trace: &GenerationTrace,
    profile: &EntropyProfile,
    spans: &[FlaggedSpan],
) -> serde_json::Value {
    serde_json::json!({
        "steps": trace.steps.len(),
        "truncated": trace.truncated,
        "mean_normalized_entropy": profile.mean,
        "peak_normalized_entropy": profile.peak,
        "peak_step": profile.peak_step,
        "collapse_ratio": profile.collapse_ratio,
        "flagged_spans": spans
            .iter()
            .map(|s| serde_json::json!({
                "text": trace.text_for_steps(s.first, s.last),
                "mean": s.mean,
                "peak_step": s.peak_step,
            }))
            .collect::<Vec<_>>(),
    })
}
