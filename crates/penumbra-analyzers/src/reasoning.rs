// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Reasoning Analyzer
// ─────────────────────────────────────────────────────────────────────
//! Step-wise quality of delimited reasoning (e.g. `<think>...</think>`).
//!
//! Each delimited segment is one reasoning step. Its tokens are found
//! through the trace's token spans, and its quality is read off their
//! normalised semantic entropy:
//!
//! - `coherence  = 1 - mean`
//! - `confidence = 1 - peak`
//! - `relevance` = similarity of the step to the prompt
//!
//! Scores under `quality_floor` become improvement targets.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use penumbra_core::{cosine_similarity, similarity_to_unit, Embedder};
use penumbra_types::report::{
    ImprovementTarget, Importance, ReasoningAnalysis, ReasoningStepReport, StepAnalysis, StepInfo,
    StepQuality, TrainingInsights,
};
use penumbra_types::{
    clamp_score, AnalyzerConfig, GenerationTrace, InsightReport, PenumbraError, PenumbraResult,
    ReasoningDelimiters,
};

use crate::entropy::{describe_uncertainty, summary_json};
use crate::insight::InsightGenerator;
use crate::phase::run_analysis;
use crate::profile::EntropyProfile;
use crate::report::ReportBuilder;
use crate::{AnalysisInputs, Analyzer, Capabilities, Modality};

/// Byte range of one reasoning segment's content (delimiters excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    /// No closing delimiter; the segment runs to the end of the text.
    pub open: bool,
}

/// Split `text` into delimited segments.
///
/// End delimiters without a preceding start are ignored. Segments with
/// only whitespace are dropped.
pub fn segment_reasoning(text: &str, delimiters: &ReasoningDelimiters) -> Vec<Segment> {
    let mut segments = Vec::new();
    if delimiters.start.is_empty() || delimiters.end.is_empty() {
        return segments;
    }
    let mut pos = 0usize;
    while let Some(offset) = text[pos..].find(&delimiters.start) {
        let start = pos + offset + delimiters.start.len();
        let (end, open, next) = match text[start..].find(&delimiters.end) {
            Some(e) => (start + e, false, start + e + delimiters.end.len()),
            None => (text.len(), true, text.len()),
        };
        if !text[start..end].trim().is_empty() {
            segments.push(Segment { start, end, open });
        }
        pos = next;
    }
    segments
}

/// Coarse tag describing what a step does.
pub fn classify_step(content: &str) -> &'static str {
    let lower = content.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if has(&["verify", "check", "confirm", "double-check", "validate"]) {
        "verification"
    } else if has(&["therefore", "thus", "hence", "in conclusion", "final answer", "so the answer"]) {
        "conclusion"
    } else if has(&["suppose", "assume", "perhaps", "maybe", "what if", "hypothes"]) {
        "hypothesis"
    } else if has(&["calculate", "compute", "multiply", "divide", "sum of"])
        || (lower.chars().any(|c| c.is_ascii_digit())
            && lower.chars().any(|c| matches!(c, '=' | '+' | '*' | '/' | '×' | '÷')))
    {
        "calculation"
    } else {
        "reasoning"
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

/// Overlap coefficient of the keyword sets, in [0, 1].
pub fn lexical_relevance(content: &str, prompt: &str) -> f64 {
    let a = keywords(content);
    let b = keywords(prompt);
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / smaller as f64
}

pub struct ReasoningAnalyzer {
    config: AnalyzerConfig,
    caps: Capabilities,
}

impl ReasoningAnalyzer {
    pub fn new(config: AnalyzerConfig) -> PenumbraResult<Self> {
        config.validate()?;
        Ok(Self { config, caps: Capabilities::default() })
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.caps = self.caps.with_embedder(embedder);
        self
    }

    pub fn with_insight(mut self, generator: Arc<dyn InsightGenerator>) -> Self {
        self.caps = self.caps.with_insight(&self.config, generator);
        self
    }

    /// Embedding relevance, or lexical overlap without a usable embedder.
    fn relevance(&self, content: &str, prompt: &str, builder: &mut ReportBuilder) -> f64 {
        let Some(embedder) = &self.caps.embedder else {
            return lexical_relevance(content, prompt);
        };
        match embedder.embed_batch(&[content, prompt]) {
            Ok(v) if v.len() == 2 => similarity_to_unit(cosine_similarity(&v[0], &v[1])),
            Ok(v) => {
                builder.mark_degraded(format!("embedder returned {} vectors for 2 texts", v.len()));
                lexical_relevance(content, prompt)
            }
            Err(e) => {
                builder.mark_degraded(format!("relevance: {e}"));
                lexical_relevance(content, prompt)
            }
        }
    }

    fn targets(&self, quality: &StepQuality, peak_token: Option<&str>) -> Vec<ImprovementTarget> {
        let floor = self.config.quality_floor;
        let importance = |score: f64| Importance::from_shortfall((floor - score) / floor);
        let mut targets = Vec::new();
        if quality.coherence < floor {
            targets.push(ImprovementTarget {
                aspect: "coherence".to_string(),
                importance: importance(quality.coherence),
                current_issue: format!(
                    "uncertainty stays high across the step (coherence {:.2})",
                    quality.coherence
                ),
                training_suggestion: "train on worked solutions where each step follows from the previous one"
                    .to_string(),
            });
        }
        if quality.relevance < floor {
            targets.push(ImprovementTarget {
                aspect: "relevance".to_string(),
                importance: importance(quality.relevance),
                current_issue: format!("step drifts from the question (relevance {:.2})", quality.relevance),
                training_suggestion: "reward steps that use the quantities and constraints stated in the problem"
                    .to_string(),
            });
        }
        if quality.confidence < floor {
            let at = peak_token.map(|t| format!(" at {:?}", t.trim())).unwrap_or_default();
            targets.push(ImprovementTarget {
                aspect: "confidence".to_string(),
                importance: importance(quality.confidence),
                current_issue: format!("uncertainty peaks{at} (confidence {:.2})", quality.confidence),
                training_suggestion: "add targeted examples for the concept behind the uncertain token"
                    .to_string(),
            });
        }
        targets
    }

    fn report(&self, trace: &GenerationTrace, delimiters: &ReasoningDelimiters) -> InsightReport {
        let profile = EntropyProfile::from_trace(trace);
        let mut builder = ReportBuilder::new(profile.base_scores());
        let spans = describe_uncertainty(trace, &profile, &self.config, &mut builder);

        let segments = segment_reasoning(&trace.generated_text, delimiters);
        let mut steps = Vec::with_capacity(segments.len());
        let mut weak = Vec::new();
        for (i, segment) in segments.iter().enumerate() {
            let content = trace.generated_text[segment.start..segment.end].trim();
            let covered: Vec<usize> = trace
                .token_spans
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.is_empty() && s.start < segment.end && s.end > segment.start)
                .map(|(idx, _)| idx)
                .collect();

            let (mean, peak, peak_step) = match (covered.first(), covered.last()) {
                (Some(&first), Some(&last)) => profile.range(first, last),
                _ => {
                    log::debug!("reasoning step {} has no aligned tokens; using trace-wide entropy", i + 1);
                    (profile.mean, profile.peak, profile.peak_step)
                }
            };
            let quality = StepQuality {
                coherence: clamp_score(1.0 - mean, 0.0, 1.0),
                relevance: clamp_score(self.relevance(content, &trace.prompt, &mut builder), 0.0, 1.0),
                confidence: clamp_score(1.0 - peak, 0.0, 1.0),
            };
            let peak_token = peak_step.map(|s| trace.steps[s].chosen_token.as_str());
            let improvement_targets = self.targets(&quality, peak_token);
            if !improvement_targets.is_empty() {
                weak.push(i + 1);
            }
            if segment.open {
                builder.issue(
                    "unterminated reasoning step",
                    format!("step {} has no closing {:?}", i + 1, delimiters.end),
                );
            }
            steps.push(ReasoningStepReport {
                step_number: i + 1,
                step_info: StepInfo {
                    content: content.to_string(),
                    step_type: classify_step(content).to_string(),
                },
                analysis: StepAnalysis {
                    training_insights: TrainingInsights { step_quality: quality, improvement_targets },
                },
            });
        }

        if steps.is_empty() {
            builder.issue(
                "no delimited reasoning",
                format!(
                    "no text between {:?} and {:?} in the output",
                    delimiters.start, delimiters.end
                ),
            );
        } else {
            let confidence = steps
                .iter()
                .map(|s| s.analysis.training_insights.step_quality.confidence)
                .sum::<f64>()
                / steps.len() as f64;
            builder.scores_mut().confidence_score = confidence;
        }
        if !weak.is_empty() {
            builder.issue(
                "weak reasoning steps",
                format!(
                    "steps {} fall below the quality floor {:.2}",
                    weak.iter().map(usize::to_string).collect::<Vec<_>>().join(", "),
                    self.config.quality_floor
                ),
            );
            builder.suggestion(
                "strengthen the weak steps",
                "follow the per-step improvement targets in reasoning_analysis",
            );
        }

        let mut summary = summary_json(trace, &profile, &spans);
        summary["reasoning_steps"] = serde_json::json!(steps
            .iter()
            .map(|s| serde_json::json!({
                "step_number": s.step_number,
                "type": s.step_info.step_type,
                "content": s.step_info.content,
                "quality": s.analysis.training_insights.step_quality,
            }))
            .collect::<Vec<_>>());
        builder.reasoning(ReasoningAnalysis { steps });

        if let Some(payload) = self.caps.narrate(self.name(), trace, summary, &mut builder) {
            if let Some(reasoning) = builder.reasoning_mut() {
                for extra in payload.steps {
                    match reasoning.steps.iter_mut().find(|s| s.step_number == extra.step_number) {
                        Some(step) => step
                            .analysis
                            .training_insights
                            .improvement_targets
                            .extend(extra.improvement_targets),
                        None => log::debug!(
                            "insight refers to unknown reasoning step {}",
                            extra.step_number
                        ),
                    }
                }
            }
        }
        builder.build()
    }
}

impl Analyzer for ReasoningAnalyzer {
    fn name(&self) -> &'static str {
        "reasoning"
    }

    fn requires(&self) -> BTreeSet<Modality> {
        BTreeSet::from([Modality::ReasoningDelimiters])
    }

    fn analyze(&self, trace: &GenerationTrace, inputs: &AnalysisInputs) -> PenumbraResult<InsightReport> {
        run_analysis(self.name(), trace, || {
            let delimiters = inputs
                .resolve_delimiters(trace, &self.config)
                .ok_or_else(|| PenumbraError::MissingModality(Modality::ReasoningDelimiters.to_string()))?;
            Ok(self.report(trace, &delimiters))
        })
    }
}
