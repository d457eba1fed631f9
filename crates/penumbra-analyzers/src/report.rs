// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Report Builder
// ─────────────────────────────────────────────────────────────────────
//! Assembles an `InsightReport` from structural findings and optional
//! narrative enrichment.
//!
//! Structural fields are always present. Scores are clamped to [0, 1]
//! on `build`, and any failed enrichment flips `degraded`.

use penumbra_types::report::{
    Issue, NarrativeStatus, ReasoningAnalysis, Suggestion, UncertainPart, UncertaintyAnalysis,
    VisualAnalysis,
};
use penumbra_types::{EnrichmentStatus, InsightReport, PenumbraError, Scores};

use crate::insight::{EnrichmentFailure, InsightPayload};

pub struct ReportBuilder {
    scores: Scores,
    analysis: UncertaintyAnalysis,
    reasoning: Option<ReasoningAnalysis>,
    visual: Option<VisualAnalysis>,
    narrative: NarrativeStatus,
    failures: Vec<String>,
}

impl ReportBuilder {
    pub fn new(scores: Scores) -> Self {
        Self {
            scores,
            analysis: UncertaintyAnalysis::default(),
            reasoning: None,
            visual: None,
            narrative: NarrativeStatus::default(),
            failures: Vec::new(),
        }
    }

    pub fn scores_mut(&mut self) -> &mut Scores {
        &mut self.scores
    }

    pub fn uncertain_part(&mut self, text: impl Into<String>, why: impl Into<String>) -> &mut Self {
        self.analysis.high_uncertainty_parts.push(UncertainPart { text: text.into(), why: why.into() });
        self
    }

    pub fn issue(&mut self, issue: impl Into<String>, evidence: impl Into<String>) -> &mut Self {
        self.analysis.main_issues.push(Issue { issue: issue.into(), evidence: evidence.into() });
        self
    }

    pub fn suggestion(&mut self, what: impl Into<String>, how: impl Into<String>) -> &mut Self {
        self.analysis.key_suggestions.push(Suggestion { what: what.into(), how: how.into() });
        self
    }

    pub fn reasoning(&mut self, reasoning: ReasoningAnalysis) -> &mut Self {
        self.reasoning = Some(reasoning);
        self
    }

    pub fn reasoning_mut(&mut self) -> Option<&mut ReasoningAnalysis> {
        self.reasoning.as_mut()
    }

    pub fn visual(&mut self, visual: VisualAnalysis) -> &mut Self {
        self.visual = Some(visual);
        self
    }

    pub fn visual_mut(&mut self) -> Option<&mut VisualAnalysis> {
        self.visual.as_mut()
    }

    /// Note a failed optional step (embedder, insight generator, ...).
    pub fn mark_degraded(&mut self, reason: impl Into<String>) -> &mut Self {
        let reason = reason.into();
        log::warn!("report degraded: {reason}");
        self.failures.push(reason);
        self
    }

    /// Merge the shared narrative fields of an insight reply.
    ///
    /// Variant-specific fields (`steps`, `missed_regions`) are left to
    /// the caller.
    pub fn enrich(&mut self, payload: &InsightPayload) -> &mut Self {
        self.analysis
            .high_uncertainty_parts
            .extend(payload.high_uncertainty_parts.iter().cloned());
        self.analysis.main_issues.extend(payload.main_issues.iter().cloned());
        self.analysis.key_suggestions.extend(payload.key_suggestions.iter().cloned());
        self.narrative.status = EnrichmentStatus::Enriched;
        self
    }

    pub fn enrichment_failed(&mut self, failure: EnrichmentFailure) -> &mut Self {
        let EnrichmentFailure { error, raw_text } = failure;
        if let PenumbraError::MalformedInsightOutput(_) = error {
            self.narrative.raw_text = raw_text;
        }
        self.mark_degraded(format!("insight: {error}"))
    }

    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn build(self) -> InsightReport {
        let degraded = !self.failures.is_empty();
        let mut narrative = self.narrative;
        if degraded {
            narrative.status = EnrichmentStatus::Degraded;
        }
        narrative.failures = self.failures;
        InsightReport {
            scores: self.scores.clamped(),
            uncertainty_analysis: self.analysis,
            reasoning_analysis: self.reasoning,
            visual_analysis: self.visual,
            degraded,
            narrative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_only() {
        let mut b = ReportBuilder::new(Scores::new(0.3, 0.7));
        b.uncertain_part("the year", "two dates compete");
        let r = b.build();
        assert!(!r.degraded);
        assert_eq!(r.narrative.status, EnrichmentStatus::NotRequested);
        assert_eq!(r.uncertainty_analysis.high_uncertainty_parts.len(), 1);
    }

    #[test]
    fn test_clamps_on_build() {
        let mut b = ReportBuilder::new(Scores::new(0.3, 0.7));
        b.scores_mut().overall_uncertainty = f64::NAN;
        b.scores_mut().visual_grounding = Some(1.7);
        let r = b.build();
        assert_eq!(r.scores.overall_uncertainty, 0.0);
        assert_eq!(r.scores.visual_grounding, Some(1.0));
    }

    #[test]
    fn test_enriched() {
        let mut b = ReportBuilder::new(Scores::new(0.3, 0.7));
        b.issue("structural", "peak at step 2");
        let payload = InsightPayload {
            main_issues: vec![Issue { issue: "narrative".into(), evidence: String::new() }],
            ..Default::default()
        };
        b.enrich(&payload);
        let r = b.build();
        assert_eq!(r.narrative.status, EnrichmentStatus::Enriched);
        assert_eq!(r.uncertainty_analysis.main_issues.len(), 2);
        assert!(!r.degraded);
    }

    #[test]
    fn test_malformed_keeps_raw_text() {
        let mut b = ReportBuilder::new(Scores::new(0.3, 0.7));
        b.enrichment_failed(EnrichmentFailure {
            error: PenumbraError::MalformedInsightOutput("no JSON".into()),
            raw_text: Some("prose".into()),
        });
        let r = b.build();
        assert!(r.degraded);
        assert_eq!(r.narrative.status, EnrichmentStatus::Degraded);
        assert_eq!(r.narrative.raw_text.as_deref(), Some("prose"));
        assert_eq!(r.narrative.failures.len(), 1);
    }

    #[test]
    fn test_degraded_wins_over_enriched() {
        let mut b = ReportBuilder::new(Scores::new(0.3, 0.7));
        b.enrich(&InsightPayload {
            missed_regions: vec!["sky".into()],
            ..Default::default()
        });
        b.mark_degraded("embedder offline");
        let r = b.build();
        assert!(r.degraded);
        assert_eq!(r.narrative.status, EnrichmentStatus::Degraded);
    }
}
