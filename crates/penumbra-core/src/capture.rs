// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Distribution Capture
// ─────────────────────────────────────────────────────────────────────
//! Turns the host's per-step scores into a truncated, normalised
//! `TopKDistribution`.
//!
//! Order of operations is fixed: normalise → keep the `top_k` most
//! probable candidates (ties by original index) → fold candidates below
//! `min_token_prob` into the residual, never dropping the top candidate.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use penumbra_types::token::MASS_TOLERANCE;
use penumbra_types::{PenumbraError, PenumbraResult, TokenCandidate, TopKDistribution};

/// Encoding of the values the host hands over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    /// Unnormalised logits; softmax is applied.
    Logits,
    /// Probabilities. A sum below 1 means the rest of the vocabulary was
    /// not reported and is treated as residual mass.
    Probabilities,
    /// Natural-log probabilities (≤ 0).
    LogProbs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredToken {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u32>,
    pub value: f64,
}

/// Sparse score vector: one entry per candidate the host reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawScores {
    pub kind: ScoreKind,
    pub entries: Vec<ScoredToken>,
}

impl RawScores {
    pub fn new<S: Into<String>>(kind: ScoreKind, entries: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self {
            kind,
            entries: entries
                .into_iter()
                .map(|(text, value)| ScoredToken { text: text.into(), token_id: None, value })
                .collect(),
        }
    }

    pub fn logits<S: Into<String>>(entries: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self::new(ScoreKind::Logits, entries)
    }

    pub fn probabilities<S: Into<String>>(entries: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self::new(ScoreKind::Probabilities, entries)
    }

    pub fn log_probs<S: Into<String>>(entries: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self::new(ScoreKind::LogProbs, entries)
    }
}

/// Capture a distribution from sparse host scores.
pub fn capture(
    step_index: usize,
    scores: &RawScores,
    top_k: usize,
    min_token_prob: f64,
) -> PenumbraResult<TopKDistribution> {
    check_params(top_k, min_token_prob)?;
    let values: Vec<f64> = scores.entries.iter().map(|e| e.value).collect();
    let probs = to_probabilities(step_index, scores.kind, &values)?;
    let selected = select_top_k(&probs, top_k);
    Ok(build(step_index, &probs, &selected, min_token_prob, |idx| {
        let entry = &scores.entries[idx];
        let logit = (scores.kind == ScoreKind::Logits).then_some(entry.value);
        (entry.text.clone(), entry.token_id, logit)
    }))
}

/// Capture from a full-vocabulary score slice.
///
/// Only the selected ids are passed to `decode`, so the cost of turning
/// ids into text is bounded by `top_k`.
pub fn capture_dense(
    step_index: usize,
    kind: ScoreKind,
    values: &[f64],
    top_k: usize,
    min_token_prob: f64,
    decode: impl Fn(u32) -> String,
) -> PenumbraResult<TopKDistribution> {
    check_params(top_k, min_token_prob)?;
    let probs = to_probabilities(step_index, kind, values)?;
    let selected = select_top_k(&probs, top_k);
    Ok(build(step_index, &probs, &selected, min_token_prob, |idx| {
        let logit = (kind == ScoreKind::Logits).then_some(values[idx]);
        (decode(idx as u32), Some(idx as u32), logit)
    }))
}

fn check_params(top_k: usize, min_token_prob: f64) -> PenumbraResult<()> {
    if top_k < 1 {
        return Err(PenumbraError::Config(format!("top_k must be >= 1, got {top_k}")));
    }
    if !(0.0..1.0).contains(&min_token_prob) {
        return Err(PenumbraError::Config(format!(
            "min_token_prob must be in [0, 1), got {min_token_prob}"
        )));
    }
    Ok(())
}

/// Normalise host values to probabilities.
fn to_probabilities(step_index: usize, kind: ScoreKind, values: &[f64]) -> PenumbraResult<Vec<f64>> {
    if values.is_empty() {
        return Err(PenumbraError::InvalidDistribution(format!(
            "step {step_index}: no candidate scores"
        )));
    }
    if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
        return Err(PenumbraError::InvalidDistribution(format!(
            "step {step_index}: non-finite score {} at index {pos}",
            values[pos]
        )));
    }

    match kind {
        ScoreKind::Logits => {
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let exps: Vec<f64> = values.iter().map(|v| (v - max).exp()).collect();
            let sum: f64 = exps.iter().sum();
            Ok(exps.into_iter().map(|e| e / sum).collect())
        }
        ScoreKind::LogProbs => {
            if let Some(pos) = values.iter().position(|&lp| lp > 1e-9) {
                return Err(PenumbraError::InvalidDistribution(format!(
                    "step {step_index}: log-probability {} > 0 at index {pos}",
                    values[pos]
                )));
            }
            let probs: Vec<f64> = values.iter().map(|lp| lp.min(0.0).exp()).collect();
            normalise_probabilities(step_index, probs)
        }
        ScoreKind::Probabilities => normalise_probabilities(step_index, values.to_vec()),
    }
}

fn normalise_probabilities(step_index: usize, mut probs: Vec<f64>) -> PenumbraResult<Vec<f64>> {
    if let Some(pos) = probs.iter().position(|&p| p < 0.0) {
        return Err(PenumbraError::InvalidDistribution(format!(
            "step {step_index}: negative probability {} at index {pos}",
            probs[pos]
        )));
    }
    let sum: f64 = probs.iter().sum();
    if sum <= 0.0 {
        return Err(PenumbraError::InvalidDistribution(format!(
            "step {step_index}: probabilities carry no mass"
        )));
    }
    if sum > 1.0 + MASS_TOLERANCE {
        log::debug!("step {step_index}: renormalising probabilities summing to {sum:.6}");
        for p in &mut probs {
            *p /= sum;
        }
    }
    Ok(probs)
}

/// Descending probability, ascending original index. A total order, so
/// the unstable selection below is still deterministic.
#[inline]
fn by_rank(probs: &[f64], a: usize, b: usize) -> Ordering {
    probs[b].total_cmp(&probs[a]).then(a.cmp(&b))
}

/// Indices of the `top_k` most probable non-zero candidates, in rank order.
fn select_top_k(probs: &[f64], top_k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] > 0.0).collect();
    if idx.len() > top_k {
        idx.select_nth_unstable_by(top_k - 1, |&a, &b| by_rank(probs, a, b));
        idx.truncate(top_k);
    }
    idx.sort_unstable_by(|&a, &b| by_rank(probs, a, b));
    idx
}

fn build(
    step_index: usize,
    probs: &[f64],
    selected: &[usize],
    min_token_prob: f64,
    describe: impl Fn(usize) -> (String, Option<u32>, Option<f64>),
) -> TopKDistribution {
    let mut candidates = Vec::with_capacity(selected.len());
    for (position, &idx) in selected.iter().enumerate() {
        let p = probs[idx];
        if position > 0 && p < min_token_prob {
            continue;
        }
        let (text, token_id, logit) = describe(idx);
        candidates.push(TokenCandidate {
            text,
            probability: p.min(1.0),
            rank: candidates.len(),
            original_index: idx,
            token_id,
            logit,
            embedding: None,
        });
    }

    let kept: f64 = candidates.iter().map(|c| c.probability).sum();
    let residual_mass = (1.0 - kept).max(0.0);
    if candidates.len() < selected.len() {
        log::trace!(
            "step {step_index}: folded {} low-probability candidates into residual",
            selected.len() - candidates.len()
        );
    }

    TopKDistribution { step_index, candidates, residual_mass }
}
