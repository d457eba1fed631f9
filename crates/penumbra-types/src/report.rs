// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Penumbra Insight Report Schema
// ─────────────────────────────────────────────────────────────────────
//! Serialisable report returned by every analyzer.
//!
//! Field names are a compatibility contract with downstream dashboards:
//! do not rename them.

use serde::{Deserialize, Serialize};

/// Clamp a value to [lo, hi]; non-finite values map to lo.
#[inline]
pub fn clamp_score(value: f64, lo: f64, hi: f64) -> f64 {
    if !value.is_finite() {
        log::warn!("clamp_score: non-finite score {value}, clamping to {lo:.4}");
        return lo;
    }
    value.clamp(lo, hi)
}

/// Shared score block, every value in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub overall_uncertainty: f64,
    #[serde(alias = "confidence")]
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hallucination_risk: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_grounding: Option<f64>,
}

impl Scores {
    pub fn new(overall_uncertainty: f64, confidence_score: f64) -> Self {
        Self {
            overall_uncertainty: clamp_score(overall_uncertainty, 0.0, 1.0),
            confidence_score: clamp_score(confidence_score, 0.0, 1.0),
            hallucination_risk: None,
            visual_grounding: None,
        }
    }

    pub fn with_hallucination_risk(mut self, risk: f64) -> Self {
        self.hallucination_risk = Some(clamp_score(risk, 0.0, 1.0));
        self
    }

    pub fn with_visual_grounding(mut self, grounding: f64) -> Self {
        self.visual_grounding = Some(clamp_score(grounding, 0.0, 1.0));
        self
    }

    /// Re-clamp every field (used after deserialising foreign input).
    pub fn clamped(self) -> Self {
        Self {
            overall_uncertainty: clamp_score(self.overall_uncertainty, 0.0, 1.0),
            confidence_score: clamp_score(self.confidence_score, 0.0, 1.0),
            hallucination_risk: self.hallucination_risk.map(|v| clamp_score(v, 0.0, 1.0)),
            visual_grounding: self.visual_grounding.map(|v| clamp_score(v, 0.0, 1.0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncertainPart {
    pub text: String,
    pub why: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub issue: String,
    #[serde(default)]
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub what: String,
    #[serde(default)]
    pub how: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncertaintyAnalysis {
    #[serde(default)]
    pub high_uncertainty_parts: Vec<UncertainPart>,
    #[serde(default)]
    pub main_issues: Vec<Issue>,
    #[serde(default)]
    pub key_suggestions: Vec<Suggestion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
}

impl Importance {
    /// Map a shortfall in [0, 1] to an importance band.
    pub fn from_shortfall(shortfall: f64) -> Self {
        if shortfall >= 0.5 {
            Importance::High
        } else if shortfall >= 0.25 {
            Importance::Medium
        } else {
            Importance::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovementTarget {
    pub aspect: String,
    pub importance: Importance,
    pub current_issue: String,
    pub training_suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepQuality {
    pub coherence: f64,
    pub relevance: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingInsights {
    pub step_quality: StepQuality,
    #[serde(default)]
    pub improvement_targets: Vec<ImprovementTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAnalysis {
    pub training_insights: TrainingInsights,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub content: String,
    #[serde(rename = "type")]
    pub step_type: String,
}

/// One delimited reasoning segment and its quality assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStepReport {
    pub step_number: usize,
    pub step_info: StepInfo,
    pub analysis: StepAnalysis,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningAnalysis {
    pub steps: Vec<ReasoningStepReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionQuality {
    pub score: f64,
    #[serde(default)]
    pub key_regions: Vec<String>,
    #[serde(default)]
    pub missed_regions: Vec<String>,
}

/// How one generated word lines up with the image area it attended to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAlignment {
    pub word: String,
    pub focused_spot: String,
    pub relevance: f64,
    pub uncertainty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualAnalysis {
    pub attention_quality: AttentionQuality,
    #[serde(default)]
    pub token_attention_alignment: Vec<TokenAlignment>,
}

/// Outcome of the optional narrative enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    /// No insight generator configured; structural-only by choice.
    #[default]
    NotRequested,
    Enriched,
    /// Some enrichment failed; structural fields are still valid.
    Degraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeStatus {
    pub status: EnrichmentStatus,
    /// Unparseable generator reply, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub failures: Vec<String>,
}

/// Structured diagnostic produced by an analyzer. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightReport {
    pub scores: Scores,
    pub uncertainty_analysis: UncertaintyAnalysis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_analysis: Option<ReasoningAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_analysis: Option<VisualAnalysis>,
    /// True when any optional enrichment failed.
    pub degraded: bool,
    #[serde(default)]
    pub narrative: NarrativeStatus,
}

impl InsightReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let mut report: InsightReport = serde_json::from_str(json)?;
        report.scores = report.scores.clamped();
        Ok(report)
    }
}
