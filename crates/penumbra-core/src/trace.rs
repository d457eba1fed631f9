// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Trace Aggregator
// ─────────────────────────────────────────────────────────────────────
//! Accumulates per-step metrics into a `GenerationTrace`.
//!
//! The aggregator is single-writer. It stays in `Capturing` until
//! `finalize` (or `cancel`) freezes it; after that every `ingest` fails
//! and repeated `finalize` calls with the same request return the same
//! trace.

use serde::{Deserialize, Serialize};

use penumbra_types::{
    AttentionPayload, CaptureConfig, GenerationTrace, ImageInput, PenumbraError, PenumbraResult,
    ReasoningDelimiters, StepAttention, TextSpan, TokenMetrics, TracePhase, TraceSummary,
};

/// How far ahead of the cursor a token may be found in the generated
/// text. Covers whitespace normalisation and skipped special tokens.
const ALIGN_LOOKAHEAD: usize = 16;

/// Everything the host knows once generation has ended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub prompt: String,
    pub generated_text: String,
    #[serde(default)]
    pub image: Option<ImageInput>,
    /// Replaces attention collected during ingest when present.
    #[serde(default)]
    pub attention: Option<AttentionPayload>,
    #[serde(default)]
    pub delimiters: Option<ReasoningDelimiters>,
}

impl FinalizeRequest {
    pub fn new(prompt: impl Into<String>, generated_text: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            generated_text: generated_text.into(),
            ..Default::default()
        }
    }

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
}

#[derive(Debug, Clone, Default)]
struct RunningStats {
    count: usize,
    sum_raw: f64,
    sum_semantic: f64,
    peak_semantic: f64,
    peak_step: Option<usize>,
    collapse_steps: Vec<usize>,
    fallback_steps: usize,
}

impl RunningStats {
    fn push(&mut self, m: &TokenMetrics, collapse_delta: f64) {
        self.count += 1;
        self.sum_raw += m.raw_entropy;
        self.sum_semantic += m.semantic_entropy;
        if self.peak_step.is_none() || m.semantic_entropy > self.peak_semantic {
            self.peak_semantic = m.semantic_entropy;
            self.peak_step = Some(m.step_index);
        }
        if m.is_paraphrase_collapse(collapse_delta) {
            self.collapse_steps.push(m.step_index);
        }
        if m.partition.fallback {
            self.fallback_steps += 1;
        }
    }

    fn summary(&self) -> TraceSummary {
        let n = self.count.max(1) as f64;
        TraceSummary {
            steps: self.count,
            mean_raw_entropy: if self.count == 0 { 0.0 } else { self.sum_raw / n },
            mean_semantic_entropy: if self.count == 0 { 0.0 } else { self.sum_semantic / n },
            peak_semantic_entropy: self.peak_semantic,
            peak_step: self.peak_step,
            collapse_steps: self.collapse_steps.clone(),
            fallback_steps: self.fallback_steps,
        }
    }
}

/// Single-writer builder for one `GenerationTrace`.
pub struct TraceAggregator {
    top_k: usize,
    collapse_delta: f64,
    steps: Vec<TokenMetrics>,
    attention: Vec<StepAttention>,
    stats: RunningStats,
    frozen: Option<(FinalizeRequest, GenerationTrace)>,
}

impl TraceAggregator {
    pub fn new(top_k: usize, collapse_delta: f64) -> Self {
        Self {
            top_k,
            collapse_delta,
            steps: Vec::new(),
            attention: Vec::new(),
            stats: RunningStats::default(),
            frozen: None,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.top_k, config.collapse_delta)
    }

    pub fn phase(&self) -> TracePhase {
        if self.frozen.is_some() {
            TracePhase::Finalized
        } else {
            TracePhase::Capturing
        }
    }

    /// Index the next `ingest` must carry.
    pub fn next_step_index(&self) -> usize {
        self.steps.len()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Running aggregates over the steps ingested so far.
    pub fn summary(&self) -> TraceSummary {
        self.stats.summary()
    }

    /// Fail unless the aggregator is open and `step_index` is next.
    pub fn check_next(&self, step_index: usize) -> PenumbraResult<()> {
        if self.frozen.is_some() {
            return Err(PenumbraError::Sequence(format!(
                "ingest of step {step_index} after finalize"
            )));
        }
        let expected = self.next_step_index();
        if step_index != expected {
            return Err(PenumbraError::Sequence(format!(
                "expected step {expected}, got {step_index}"
            )));
        }
        Ok(())
    }

    pub fn ingest(&mut self, metrics: TokenMetrics) -> PenumbraResult<()> {
        self.ingest_with_attention(metrics, None)
    }

    /// Append one step, optionally with its attention over image patches.
    pub fn ingest_with_attention(
        &mut self,
        metrics: TokenMetrics,
        attention: Option<Vec<f32>>,
    ) -> PenumbraResult<()> {
        self.check_next(metrics.step_index)?;
        self.stats.push(&metrics, self.collapse_delta);
        if let Some(weights) = attention {
            self.attention.push(StepAttention { step_index: metrics.step_index, weights });
        }
        self.steps.push(metrics);
        Ok(())
    }

    /// Freeze the trace. Idempotent for an identical request.
    pub fn finalize(&mut self, request: FinalizeRequest) -> PenumbraResult<GenerationTrace> {
        self.freeze(request, false)
    }

    /// Host-initiated early stop: finalize with `truncated = true`.
    pub fn cancel(&mut self, request: FinalizeRequest) -> PenumbraResult<GenerationTrace> {
        self.freeze(request, true)
    }

    fn freeze(&mut self, request: FinalizeRequest, truncated: bool) -> PenumbraResult<GenerationTrace> {
        if let Some((previous, trace)) = &self.frozen {
            if *previous == request {
                return Ok(trace.clone());
            }
            return Err(PenumbraError::Sequence(
                "trace already finalized with different arguments".to_string(),
            ));
        }

        let token_spans = align_tokens(
            &request.generated_text,
            self.steps.iter().map(|m| m.chosen_token.as_str()),
        );
        let attention = match &request.attention {
            Some(payload) => Some(payload.clone()),
            None if !self.attention.is_empty() => Some(AttentionPayload {
                steps: std::mem::take(&mut self.attention),
            }),
            None => None,
        };

        let trace = GenerationTrace {
            phase: TracePhase::Finalized,
            prompt: request.prompt.clone(),
            generated_text: request.generated_text.clone(),
            steps: self.steps.clone(),
            top_k: self.top_k,
            image: request.image.clone(),
            attention,
            delimiters: request.delimiters.clone(),
            truncated,
            summary: self.stats.summary(),
            token_spans,
        };
        log::debug!(
            "trace finalized: {} steps, truncated={truncated}, mean semantic entropy {:.4}",
            trace.steps.len(),
            trace.summary.mean_semantic_entropy
        );
        self.frozen = Some((request, trace.clone()));
        Ok(trace)
    }
}

/// Locate each token in `text`, left to right.
///
/// Tokens that cannot be found near the cursor (special tokens stripped
/// by the detokenizer, for instance) get a zero-width span.
pub fn align_tokens<'a>(text: &str, tokens: impl IntoIterator<Item = &'a str>) -> Vec<TextSpan> {
    let mut cursor = 0usize;
    let mut spans = Vec::new();
    for token in tokens {
        let span = locate(text, cursor, token)
            .or_else(|| {
                let trimmed = token.trim();
                if trimmed.len() != token.len() {
                    locate(text, cursor, trimmed)
                } else {
                    None
                }
            })
            .unwrap_or(TextSpan { start: cursor, end: cursor });
        cursor = span.end;
        spans.push(span);
    }
    spans
}

fn locate(text: &str, cursor: usize, needle: &str) -> Option<TextSpan> {
    if needle.is_empty() {
        return None;
    }
    // Only a match starting within ALIGN_LOOKAHEAD bytes is accepted.
    let mut end = text.len().min(cursor + ALIGN_LOOKAHEAD + needle.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let window = text.get(cursor..end)?;
    let start = cursor + window.find(needle)?;
    Some(TextSpan { start, end: start + needle.len() })
}
