// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Visual Grounding Analyzer
// ─────────────────────────────────────────────────────────────────────
//! Checks whether generated words are grounded in the image area they
//! attend to.
//!
//! For every content word the peak attention patch is mapped to a
//! region descriptor (a labelled image region, else a coarse 3×3 zone).
//! A word whose uncertainty is high while its relevance to the attended
//! region is low counts as a grounding failure. With `f` the failure
//! ratio and `s` the mean relevance:
//!
//! - `visual_grounding   = s (1 - f)`
//! - `hallucination_risk = 0.5 base + 0.5 f`

use std::collections::BTreeSet;
use std::sync::Arc;

use penumbra_core::{cosine_similarity, similarity_to_unit, Embedder};
use penumbra_types::report::{AttentionQuality, TokenAlignment, VisualAnalysis};
use penumbra_types::{
    clamp_score, AnalyzerConfig, AttentionPayload, GenerationTrace, ImageInput, InsightReport,
    PenumbraError, PenumbraResult, VlmConfig,
};

use crate::entropy::{describe_uncertainty, summary_json};
use crate::insight::InsightGenerator;
use crate::phase::run_analysis;
use crate::profile::EntropyProfile;
use crate::report::ReportBuilder;
use crate::{AnalysisInputs, Analyzer, Capabilities, Modality};

const ZONE_ROWS: [&str; 3] = ["upper", "middle", "lower"];
const ZONE_COLS: [&str; 3] = ["left", "center", "right"];

/// Square patch grid of the vision encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    pub side: usize,
    pub use_cls_token: bool,
}

/// Strongest patch of one step's attention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakPatch {
    pub row: usize,
    pub col: usize,
    /// Peak weight over total weight, in [0, 1].
    pub concentration: f64,
}

impl PatchGrid {
    pub fn from_config(config: &VlmConfig) -> Self {
        Self { side: config.grid_side(), use_cls_token: config.use_cls_token }
    }

    /// Locate the peak patch, stripping the CLS weight first.
    ///
    /// Vectors that do not fill the configured grid are accepted when
    /// they form some other square grid; otherwise `None`.
    pub fn peak(&self, weights: &[f32]) -> Option<PeakPatch> {
        let patches = if self.use_cls_token && !weights.is_empty() { &weights[1..] } else { weights };
        if patches.is_empty() || patches.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return None;
        }
        let side = if patches.len() == self.side * self.side {
            self.side
        } else {
            let s = (patches.len() as f64).sqrt().round() as usize;
            if s * s != patches.len() {
                return None;
            }
            log::debug!(
                "attention has {} patches, expected {}; using a {s}x{s} grid",
                patches.len(),
                self.side * self.side
            );
            s
        };

        let mut best = 0usize;
        for (i, &w) in patches.iter().enumerate() {
            if w > patches[best] {
                best = i;
            }
        }
        let total: f64 = patches.iter().map(|&w| w as f64).sum();
        let concentration = if total > 0.0 { patches[best] as f64 / total } else { 0.0 };
        let scale = self.side as f64 / side as f64;
        // Report in configured-grid coordinates.
        Some(PeakPatch {
            row: ((best / side) as f64 * scale) as usize,
            col: ((best % side) as f64 * scale) as usize,
            concentration,
        })
    }

    /// Pixel centre of a patch in an image of the given size.
    pub fn patch_centre(&self, row: usize, col: usize, width: u32, height: u32) -> (f64, f64) {
        let side = self.side.max(1) as f64;
        (
            (col as f64 + 0.5) / side * width as f64,
            (row as f64 + 0.5) / side * height as f64,
        )
    }

    /// Coarse 3×3 zone name of a patch.
    pub fn zone(&self, row: usize, col: usize) -> String {
        let side = self.side.max(1) as f64;
        let band = |i: usize| (((i as f64 + 0.5) / side * 3.0) as usize).min(2);
        match (ZONE_ROWS[band(row)], ZONE_COLS[band(col)]) {
            ("middle", "center") => "center".to_string(),
            (r, c) => format!("{r} {c}"),
        }
    }

    /// Smallest labelled region containing the patch centre, else the zone.
    pub fn describe(&self, patch: &PeakPatch, image: &ImageInput) -> String {
        let (cx, cy) = self.patch_centre(patch.row, patch.col, image.width, image.height);
        image
            .regions
            .iter()
            .filter(|r| r.contains(cx, cy))
            .min_by_key(|r| r.area())
            .map(|r| r.label.clone())
            .unwrap_or_else(|| self.zone(patch.row, patch.col))
    }
}

fn is_content_word(token: &str) -> bool {
    token.chars().any(char::is_alphanumeric)
}

pub struct VlmAnalyzer {
    config: AnalyzerConfig,
    caps: Capabilities,
}

impl VlmAnalyzer {
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

    fn report(&self, trace: &GenerationTrace, image: &ImageInput, attention: &AttentionPayload) -> InsightReport {
        let vlm = &self.config.vlm;
        let grid = PatchGrid::from_config(vlm);
        let profile = EntropyProfile::from_trace(trace);
        let base = profile.base_scores();
        let mut builder = ReportBuilder::new(base.clone());
        let spans = describe_uncertainty(trace, &profile, &self.config, &mut builder);

        let mut embedder = self.caps.embedder.as_deref();
        let mut attention_only = embedder.is_none();
        let mut alignments: Vec<TokenAlignment> = Vec::new();
        let mut skipped = 0usize;
        for (i, metrics) in trace.steps.iter().enumerate() {
            let word = metrics.chosen_token.trim();
            if !is_content_word(word) {
                continue;
            }
            let Some(patch) = attention.for_step(i).and_then(|w| grid.peak(w)) else {
                skipped += 1;
                continue;
            };
            let spot = grid.describe(&patch, image);
            let relevance = match embedder.map(|e| e.embed_batch(&[word, spot.as_str()])) {
                Some(Ok(v)) if v.len() == 2 => similarity_to_unit(cosine_similarity(&v[0], &v[1])),
                Some(result) => {
                    let reason = match result {
                        Err(e) => e.to_string(),
                        Ok(v) => format!("embedder returned {} vectors for 2 texts", v.len()),
                    };
                    builder.mark_degraded(format!("grounding relevance: {reason}; using attention concentration"));
                    embedder = None;
                    attention_only = true;
                    patch.concentration
                }
                None => patch.concentration,
            };
            alignments.push(TokenAlignment {
                word: word.to_string(),
                focused_spot: spot,
                relevance: clamp_score(relevance, 0.0, 1.0),
                uncertainty: profile.normalized[i],
            });
        }
        if attention_only && !alignments.is_empty() {
            if self.caps.embedder.is_none() {
                builder.mark_degraded("grounding relevance: no embedder; using attention concentration");
            }
            builder.issue(
                "relevance from attention only",
                "no embedding similarity was available, so relevance is the peak patch's attention share; \
                 concentrated attention does not show the word is about that region",
            );
        }
        if skipped > 0 {
            builder.issue(
                "attention unavailable for some words",
                format!("{skipped} content word(s) had no usable attention vector"),
            );
        }

        let failures: Vec<&TokenAlignment> = alignments
            .iter()
            .filter(|a| a.uncertainty >= vlm.uncertainty_threshold && a.relevance < vlm.relevance_threshold)
            .collect();
        let failure_ratio = if alignments.is_empty() {
            0.0
        } else {
            failures.len() as f64 / alignments.len() as f64
        };
        let score = if alignments.is_empty() {
            0.0
        } else {
            alignments.iter().map(|a| a.relevance).sum::<f64>() / alignments.len() as f64
        };

        let mut key_regions: Vec<String> = Vec::new();
        for a in alignments.iter().filter(|a| a.relevance >= vlm.relevance_threshold) {
            if !key_regions.contains(&a.focused_spot) {
                key_regions.push(a.focused_spot.clone());
            }
        }
        let missed_regions: Vec<String> = image
            .regions
            .iter()
            .filter(|r| !alignments.iter().any(|a| a.focused_spot == r.label))
            .map(|r| r.label.clone())
            .collect();

        if !failures.is_empty() {
            builder.issue(
                "weak visual grounding",
                failures
                    .iter()
                    .map(|a| {
                        format!(
                            "{:?} attended {} (relevance {:.2}, uncertainty {:.2})",
                            a.word, a.focused_spot, a.relevance, a.uncertainty
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            );
            builder.suggestion(
                "strengthen visual grounding",
                "fine-tune on region-caption pairs so uncertain words attend to the objects they name",
            );
        }
        if !missed_regions.is_empty() {
            builder.suggestion(
                "cover the missed regions",
                format!("no generated word attended to: {}", missed_regions.join(", ")),
            );
        }

        let base_risk = base.hallucination_risk.unwrap_or(profile.hallucination_risk());
        *builder.scores_mut() = base
            .with_visual_grounding(score * (1.0 - failure_ratio))
            .with_hallucination_risk(0.5 * base_risk + 0.5 * failure_ratio);

        let mut summary = summary_json(trace, &profile, &spans);
        summary["visual"] = serde_json::json!({
            "caption": image.caption,
            "attention_score": score,
            "grounding_failures": failures.iter().map(|a| &a.word).collect::<Vec<_>>(),
            "key_regions": key_regions,
            "missed_regions": missed_regions,
        });
        builder.visual(VisualAnalysis {
            attention_quality: AttentionQuality { score, key_regions, missed_regions },
            token_attention_alignment: alignments,
        });

        if let Some(payload) = self.caps.narrate(self.name(), trace, summary, &mut builder) {
            if let Some(visual) = builder.visual_mut() {
                for region in payload.missed_regions {
                    if !visual.attention_quality.missed_regions.contains(&region) {
                        visual.attention_quality.missed_regions.push(region);
                    }
                }
            }
        }
        builder.build()
    }
}

impl Analyzer for VlmAnalyzer {
    fn name(&self) -> &'static str {
        "vlm"
    }

    fn requires(&self) -> BTreeSet<Modality> {
        BTreeSet::from([Modality::Image, Modality::Attention])
    }

    fn analyze(&self, trace: &GenerationTrace, inputs: &AnalysisInputs) -> PenumbraResult<InsightReport> {
        run_analysis(self.name(), trace, || {
            let image = inputs
                .resolve_image(trace)
                .ok_or_else(|| PenumbraError::MissingModality(Modality::Image.to_string()))?;
            let attention = inputs
                .resolve_attention(trace)
                .ok_or_else(|| PenumbraError::MissingModality(Modality::Attention.to_string()))?;
            Ok(self.report(trace, image, attention))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use penumbra_core::{ExternalEmbedder, FinalizeRequest, RawScores, StepInput, UncertaintyEstimator};
    use penumbra_types::{CaptureConfig, EnrichmentStatus, ImageRegion, StepAttention};

    fn small_grid() -> PatchGrid {
        PatchGrid { side: 3, use_cls_token: true }
    }

    #[test]
    fn test_peak_strips_cls() {
        // CLS weight is the largest but must be ignored.
        let w = [0.9, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.1];
        let p = small_grid().peak(&w).unwrap();
        assert_eq!((p.row, p.col), (2, 2));
        assert!((p.concentration - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_peak_without_cls() {
        let g = PatchGrid { side: 2, use_cls_token: false };
        let p = g.peak(&[0.1, 0.6, 0.2, 0.1]).unwrap();
        assert_eq!((p.row, p.col), (0, 1));
        assert!((p.concentration - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_peak_rejects_bad_vectors() {
        let g = small_grid();
        assert!(g.peak(&[]).is_none());
        assert!(g.peak(&[0.0, 0.1, 0.2]).is_none());
        assert!(g.peak(&[0.0, f32::NAN, 0.1, 0.1, 0.1]).is_none());
    }

    #[test]
    fn test_zone_names() {
        let g = small_grid();
        assert_eq!(g.zone(0, 0), "upper left");
        assert_eq!(g.zone(1, 1), "center");
        assert_eq!(g.zone(2, 1), "lower center");
        let big = PatchGrid { side: 27, use_cls_token: true };
        assert_eq!(big.zone(26, 0), "lower left");
        assert_eq!(big.zone(13, 26), "middle right");
    }

    #[test]
    fn test_describe_prefers_smallest_region() {
        let image = ImageInput {
            width: 300,
            height: 300,
            regions: vec![
                ImageRegion { label: "bird".into(), x: 0, y: 0, width: 300, height: 300 },
                ImageRegion { label: "wing".into(), x: 200, y: 200, width: 100, height: 100 },
            ],
            caption: None,
        };
        let g = small_grid();
        let corner = PeakPatch { row: 2, col: 2, concentration: 1.0 };
        assert_eq!(g.describe(&corner, &image), "wing");
        let centre = PeakPatch { row: 1, col: 1, concentration: 1.0 };
        assert_eq!(g.describe(&centre, &image), "bird");
        let bare = ImageInput { regions: Vec::new(), ..image };
        assert_eq!(g.describe(&centre, &bare), "center");
    }

    fn config() -> AnalyzerConfig {
        AnalyzerConfig {
            vlm: VlmConfig { image_size: 42, patch_size: 14, ..Default::default() },
            ..Default::default()
        }
    }

    fn image() -> ImageInput {
        ImageInput {
            width: 300,
            height: 300,
            regions: vec![
                ImageRegion { label: "dog".into(), x: 0, y: 0, width: 100, height: 100 },
                ImageRegion { label: "ball".into(), x: 200, y: 200, width: 100, height: 100 },
            ],
            caption: Some("a dog and a ball".into()),
        }
    }

    /// Patch vector (with CLS) peaking at `cell` on a 3×3 grid.
    fn focus(cell: usize) -> Vec<f32> {
        let mut w = vec![0.5f32];
        w.extend((0..9).map(|i| if i == cell { 0.8 } else { 0.025 }));
        w
    }

    /// "A dog ." : "dog" is uncertain and attends the ball corner.
    fn dog_trace(with_attention: bool) -> GenerationTrace {
        let est = UncertaintyEstimator::new(CaptureConfig { top_k: 3, min_token_prob: 0.0, ..Default::default() })
            .unwrap();
        let mut s = est.begin();
        let steps = [
            (RawScores::probabilities([("A", 1.0)]), 0usize),
            (RawScores::probabilities([(" dog", 0.34), (" cat", 0.33), (" fox", 0.33)]), 8),
            (RawScores::probabilities([(" .", 1.0)]), 4),
        ];
        for (i, (scores, cell)) in steps.into_iter().enumerate() {
            let mut input = StepInput::new(i, scores);
            if with_attention {
                input = input.with_attention(focus(cell));
            }
            s.ingest_step(input).unwrap();
        }
        s.finalize(FinalizeRequest::new("Describe the image", "A dog .").with_image(image()))
            .unwrap()
    }

    fn label_embedder() -> Arc<dyn Embedder> {
        Arc::new(ExternalEmbedder::new(|t| {
            Ok(match t.trim() {
                "dog" | "A" => vec![1.0, 0.0],
                "ball" => vec![-1.0, 0.0],
                _ => vec![0.0, 1.0],
            })
        }))
    }

    #[test]
    fn test_missing_modalities() {
        let a = VlmAnalyzer::new(config()).unwrap();
        let mut no_image = dog_trace(true);
        no_image.image = None;
        assert_eq!(
            a.analyze(&no_image, &AnalysisInputs::default()),
            Err(PenumbraError::MissingModality("image".into()))
        );
        assert_eq!(
            a.analyze(&dog_trace(false), &AnalysisInputs::default()),
            Err(PenumbraError::MissingModality("attention payload".into()))
        );
        assert!(a
            .analyze(&no_image, &AnalysisInputs::default().with_image(image()))
            .is_ok());
    }

    #[test]
    fn test_grounding_failure_detected() {
        let a = VlmAnalyzer::new(config()).unwrap().with_embedder(label_embedder());
        let report = a.analyze(&dog_trace(true), &AnalysisInputs::default()).unwrap();
        let visual = report.visual_analysis.as_ref().unwrap();
        // "." is skipped as punctuation.
        assert_eq!(visual.token_attention_alignment.len(), 2);
        let dog = &visual.token_attention_alignment[1];
        assert_eq!(dog.word, "dog");
        assert_eq!(dog.focused_spot, "ball");
        assert!(dog.relevance < 1e-9);
        assert!(dog.uncertainty > 0.7);
        assert_eq!(visual.attention_quality.key_regions, vec!["dog".to_string()]);
        assert_eq!(visual.attention_quality.missed_regions, Vec::<String>::new());
        assert!((visual.attention_quality.score - 0.5).abs() < 1e-9);
        let grounding = report.scores.visual_grounding.unwrap();
        assert!((grounding - 0.25).abs() < 1e-9);
        assert!(report
            .uncertainty_analysis
            .main_issues
            .iter()
            .any(|i| i.issue == "weak visual grounding"));
        assert!(!report.degraded);
    }

    #[test]
    fn test_embedder_failure_falls_back_to_concentration() {
        let broken = Arc::new(ExternalEmbedder::new(|_| Err("offline".into())));
        let a = VlmAnalyzer::new(config()).unwrap().with_embedder(broken);
        let report = a.analyze(&dog_trace(true), &AnalysisInputs::default()).unwrap();
        assert!(report.degraded);
        assert_eq!(report.narrative.failures.len(), 1);
        let visual = report.visual_analysis.unwrap();
        assert!((visual.token_attention_alignment[0].relevance - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_missed_regions_without_embedder() {
        let mut trace = dog_trace(true);
        trace.attention = Some(AttentionPayload {
            steps: vec![StepAttention { step_index: 1, weights: focus(4) }],
        });
        let a = VlmAnalyzer::new(config()).unwrap();
        let report = a.analyze(&trace, &AnalysisInputs::default()).unwrap();
        let visual = report.visual_analysis.unwrap();
        assert_eq!(visual.token_attention_alignment.len(), 1);
        assert_eq!(visual.token_attention_alignment[0].focused_spot, "center");
        assert_eq!(visual.attention_quality.missed_regions, vec!["dog".to_string(), "ball".to_string()]);
        assert!((visual.token_attention_alignment[0].relevance - 0.8).abs() < 1e-6);
        assert!(report.degraded);
        assert_eq!(report.narrative.status, EnrichmentStatus::Degraded);
        assert!(report
            .uncertainty_analysis
            .main_issues
            .iter()
            .any(|i| i.issue == "relevance from attention only"));
    }
}
