// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Penumbra Generation Trace Types
// ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

use crate::error::{PenumbraError, PenumbraResult};
use crate::token::TokenMetrics;

/// Lifecycle of a trace. Analysis is only allowed once `Finalized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracePhase {
    Capturing,
    Finalized,
}

/// Byte range of one step's token inside the generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Markers that open and close a reasoning segment, e.g. `<think>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningDelimiters {
    pub start: String,
    pub end: String,
}

/// A labelled area of the input image, in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRegion {
    pub label: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ImageRegion {
    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x as f64
            && py >= self.y as f64
            && px < (self.x as u64 + self.width as u64) as f64
            && py < (self.y as u64 + self.height as u64) as f64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Image side of a vision-language generation. Pixels stay with the
/// host; the kernel only needs geometry and optional region labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInput {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub regions: Vec<ImageRegion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Attention from one generated token to the image patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttention {
    pub step_index: usize,
    pub weights: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttentionPayload {
    pub steps: Vec<StepAttention>,
}

impl AttentionPayload {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn for_step(&self, step_index: usize) -> Option<&[f32]> {
        self.steps
            .iter()
            .find(|s| s.step_index == step_index)
            .map(|s| s.weights.as_slice())
    }
}

/// Running aggregates kept while a trace is captured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: usize,
    pub mean_raw_entropy: f64,
    pub mean_semantic_entropy: f64,
    pub peak_semantic_entropy: f64,
    pub peak_step: Option<usize>,
    /// Steps where semantic entropy fell below raw entropy by more than
    /// the configured delta.
    pub collapse_steps: Vec<usize>,
    /// Steps clustered with the singleton fallback.
    pub fallback_steps: usize,
}

impl TraceSummary {
    pub fn collapse_ratio(&self) -> f64 {
        if self.steps == 0 {
            return 0.0;
        }
        self.collapse_steps.len() as f64 / self.steps as f64
    }
}

/// Complete record of one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTrace {
    pub phase: TracePhase,
    pub prompt: String,
    pub generated_text: String,
    pub steps: Vec<TokenMetrics>,
    /// `top_k` used at capture; fixes the entropy normaliser.
    pub top_k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention: Option<AttentionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiters: Option<ReasoningDelimiters>,
    pub truncated: bool,
    pub summary: TraceSummary,
    /// One span per step, aligned with `steps`.
    #[serde(default)]
    pub token_spans: Vec<TextSpan>,
}

impl GenerationTrace {
    pub fn is_finalized(&self) -> bool {
        self.phase == TracePhase::Finalized
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check that the trace can be analysed: finalized, step indices
    /// 0..n in order, spans aligned, every distribution well-formed.
    pub fn validate(&self) -> PenumbraResult<()> {
        if !self.is_finalized() {
            return Err(PenumbraError::Sequence(
                "trace is still capturing; finalize before analysis".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(PenumbraError::Sequence("trace has top_k = 0".to_string()));
        }
        for (i, m) in self.steps.iter().enumerate() {
            if m.step_index != i {
                return Err(PenumbraError::Sequence(format!(
                    "trace step at position {i} has index {}",
                    m.step_index
                )));
            }
            m.distribution.validate()?;
        }
        if self.token_spans.len() != self.steps.len() {
            return Err(PenumbraError::Sequence(format!(
                "trace has {} token spans for {} steps",
                self.token_spans.len(),
                self.steps.len()
            )));
        }
        for span in &self.token_spans {
            if span.end > self.generated_text.len()
                || span.start > span.end
                || !self.generated_text.is_char_boundary(span.start)
                || !self.generated_text.is_char_boundary(span.end)
            {
                return Err(PenumbraError::Sequence(format!(
                    "token span {}..{} is outside the generated text",
                    span.start, span.end
                )));
            }
        }
        Ok(())
    }

    /// Text covered by steps `first..=last`.
    ///
    /// Falls back to the concatenated chosen tokens when the spans do not
    /// cover any text.
    pub fn text_for_steps(&self, first: usize, last: usize) -> String {
        if first > last || last >= self.steps.len() {
            return String::new();
        }
        if let (Some(a), Some(b)) = (self.token_spans.get(first), self.token_spans.get(last)) {
            if b.end > a.start {
                if let Some(text) = self.generated_text.get(a.start..b.end) {
                    return text.to_string();
                }
            }
        }
        self.steps[first..=last]
            .iter()
            .map(|m| m.chosen_token.as_str())
            .collect()
    }
}
