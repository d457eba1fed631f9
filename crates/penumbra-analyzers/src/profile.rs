// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Entropy Profile
// ─────────────────────────────────────────────────────────────────────
//! Normalised per-step entropy of a trace and the score formulas every
//! analyzer shares.
//!
//! With `m` the mean and `p` the peak normalised semantic entropy and
//! `c` the paraphrase-collapse ratio:
//!
//! - `overall_uncertainty = 0.7 m + 0.3 p`
//! - `confidence_score    = 1 - overall_uncertainty`
//! - `hallucination_risk  = (0.6 p + 0.4 m) (1 - 0.25 c)`

use penumbra_core::normalized;
use penumbra_types::{clamp_score, GenerationTrace, Scores, TokenMetrics};

const W_MEAN: f64 = 0.7;
const W_PEAK: f64 = 0.3;
const RISK_PEAK: f64 = 0.6;
const RISK_MEAN: f64 = 0.4;
/// Share of risk removed when every step collapsed paraphrases.
const COLLAPSE_DISCOUNT: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct EntropyProfile {
    /// Semantic entropy per step, scaled to [0, 1] by `ln(top_k + 1)`.
    pub normalized: Vec<f64>,
    pub mean: f64,
    pub peak: f64,
    pub peak_step: Option<usize>,
    pub collapse_ratio: f64,
}

impl EntropyProfile {
    pub fn from_trace(trace: &GenerationTrace) -> Self {
        let normalized: Vec<f64> = trace
            .steps
            .iter()
            .map(|m| normalized(m.semantic_entropy, trace.top_k))
            .collect();
        let (mean, peak, peak_step) = stats(&normalized, 0);
        Self {
            normalized,
            mean,
            peak,
            peak_step,
            collapse_ratio: trace.summary.collapse_ratio(),
        }
    }

    pub fn len(&self) -> usize {
        self.normalized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }

    /// `(mean, peak, peak_step)` over steps `first..=last`.
    pub fn range(&self, first: usize, last: usize) -> (f64, f64, Option<usize>) {
        if first > last || first >= self.normalized.len() {
            return (0.0, 0.0, None);
        }
        let last = last.min(self.normalized.len() - 1);
        stats(&self.normalized[first..=last], first)
    }

    pub fn overall_uncertainty(&self) -> f64 {
        clamp_score(W_MEAN * self.mean + W_PEAK * self.peak, 0.0, 1.0)
    }

    pub fn hallucination_risk(&self) -> f64 {
        let risk = (RISK_PEAK * self.peak + RISK_MEAN * self.mean)
            * (1.0 - COLLAPSE_DISCOUNT * self.collapse_ratio);
        clamp_score(risk, 0.0, 1.0)
    }

    /// Shared score block.
    pub fn base_scores(&self) -> Scores {
        let overall = self.overall_uncertainty();
        Scores::new(overall, 1.0 - overall).with_hallucination_risk(self.hallucination_risk())
    }
}

fn stats(values: &[f64], offset: usize) -> (f64, f64, Option<usize>) {
    if values.is_empty() {
        return (0.0, 0.0, None);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let mut peak = values[0];
    let mut peak_step = offset;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > peak {
            peak = v;
            peak_step = offset + i;
        }
    }
    (mean, peak, Some(peak_step))
}

/// Run of steps whose windowed entropy crossed the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedSpan {
    pub first: usize,
    pub last: usize,
    pub mean: f64,
    pub peak_step: usize,
}

/// Slide a `window`-step window over `values` and flag every window
/// whose mean exceeds `threshold`. Overlapping flagged windows merge.
///
/// A trace shorter than the window is judged as one window.
pub fn flag_windows(values: &[f64], window: usize, threshold: f64) -> Vec<FlaggedSpan> {
    if values.is_empty() {
        return Vec::new();
    }
    let window = window.clamp(1, values.len());
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut sum: f64 = values[..window].iter().sum();
    for start in 0..=values.len() - window {
        if start > 0 {
            sum += values[start + window - 1] - values[start - 1];
        }
        if sum / window as f64 <= threshold {
            continue;
        }
        let end = start + window - 1;
        match spans.last_mut() {
            Some((_, last)) if start <= *last => *last = end,
            _ => spans.push((start, end)),
        }
    }

    spans
        .into_iter()
        .map(|(first, last)| {
            let (mean, _, peak) = stats(&values[first..=last], first);
            FlaggedSpan { first, last, mean, peak_step: peak.unwrap_or(first) }
        })
        .collect()
}

/// Leading candidates of a step, e.g. `"Paris" 0.55, "Lyon" 0.30`.
pub fn competing_candidates(metrics: &TokenMetrics, n: usize) -> String {
    metrics
        .distribution
        .candidates
        .iter()
        .take(n)
        .map(|c| format!("{:?} {:.2}", c.text, c.probability))
        .collect::<Vec<_>>()
        .join(", ")
}
