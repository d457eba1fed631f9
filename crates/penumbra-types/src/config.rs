// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Penumbra Configuration
// ─────────────────────────────────────────────────────────────────────

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PenumbraError, PenumbraResult};

/// When candidate embedding and clustering happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringMode {
    /// Embed and cluster inside `ingest_step` (local embedders only).
    #[default]
    PerStep,
    /// Keep the per-step path embedder-free; cluster every step at finalize.
    AtFinalize,
}

/// Per-step capture configuration.
///
/// Immutable once handed to an estimator; every trace started from that
/// estimator uses the same snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Number of candidates kept per step. Default: 100.
    pub top_k: usize,

    /// Candidates below this probability are folded into the residual
    /// (the top candidate is always kept). Default: 0.01.
    pub min_token_prob: f64,

    /// Cosine similarity needed to join an existing cluster. Default: 0.8.
    pub semantic_similarity_threshold: f64,

    /// A step is a paraphrase collapse when semantic entropy is more than
    /// this many nats below raw entropy. Default: 0.1.
    pub collapse_delta: f64,

    /// Default: per step.
    #[serde(default)]
    pub clustering: ClusteringMode,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            top_k: 100,
            min_token_prob: 0.01,
            semantic_similarity_threshold: 0.8,
            collapse_delta: 0.1,
            clustering: ClusteringMode::PerStep,
        }
    }
}

impl CaptureConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> PenumbraResult<()> {
        if self.top_k < 1 {
            return Err(PenumbraError::Config(format!(
                "top_k must be >= 1, got {}",
                self.top_k
            )));
        }
        if !(0.0..1.0).contains(&self.min_token_prob) {
            return Err(PenumbraError::Config(format!(
                "min_token_prob must be in [0, 1), got {}",
                self.min_token_prob
            )));
        }
        if !(0.0..=1.0).contains(&self.semantic_similarity_threshold) {
            return Err(PenumbraError::Config(format!(
                "semantic_similarity_threshold must be in [0, 1], got {}",
                self.semantic_similarity_threshold
            )));
        }
        if !self.collapse_delta.is_finite() || self.collapse_delta < 0.0 {
            return Err(PenumbraError::Config(format!(
                "collapse_delta must be a finite value >= 0, got {}",
                self.collapse_delta
            )));
        }
        Ok(())
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> PenumbraResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| PenumbraError::Config(format!("JSON parse error: {e}")))
    }
}

/// Bounded retry with exponential backoff for the insight generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt. Default: 2.
    pub max_retries: u32,
    /// Default: 200.
    pub initial_backoff_ms: u64,
    /// Default: 2000.
    pub max_backoff_ms: u64,
    /// Default: 2.0.
    pub multiplier: f64,
    /// Jitter factor in [0, 1] applied symmetrically. Default: 0.1.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 200,
            max_backoff_ms: 2000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `attempt` (0-based), without jitter.
    pub fn base_backoff_ms(&self, attempt: u32) -> f64 {
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        base.min(self.max_backoff_ms as f64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    pub fn validate(&self) -> PenumbraResult<()> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(PenumbraError::Config(format!(
                "retry multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(PenumbraError::Config(format!(
                "retry jitter must be in [0, 1], got {}",
                self.jitter
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(PenumbraError::Config(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

/// Connection settings for the narrative insight service.
///
/// The API key is never serialised and is redacted from `Debug`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightConfig {
    pub endpoint: String,
    pub model_id: String,
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    /// Per-attempt deadline. Default: 30000.
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model_id: String::new(),
            api_key: None,
            timeout_ms: 30_000,
            retry: RetryConfig::default(),
        }
    }
}

impl fmt::Debug for InsightConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsightConfig")
            .field("endpoint", &self.endpoint)
            .field("model_id", &self.model_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_ms", &self.timeout_ms)
            .field("retry", &self.retry)
            .finish()
    }
}

impl InsightConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> PenumbraResult<()> {
        if self.model_id.trim().is_empty() {
            return Err(PenumbraError::Config(
                "insight model_id must not be empty".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(PenumbraError::Config(
                "insight timeout_ms must be > 0".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Vision-language settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlmConfig {
    /// Side length of the square vision-encoder input. Default: 384.
    pub image_size: u32,
    /// Side length of one vision patch. Default: 14.
    pub patch_size: u32,
    /// Attention vectors carry a leading CLS weight. Default: true.
    pub use_cls_token: bool,
    /// Minimum token↔region relevance for a grounded token. Default: 0.5.
    pub relevance_threshold: f64,
    /// Normalised entropy at which a token counts as uncertain. Default: 0.5.
    pub uncertainty_threshold: f64,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            image_size: 384,
            patch_size: 14,
            use_cls_token: true,
            relevance_threshold: 0.5,
            uncertainty_threshold: 0.5,
        }
    }
}

impl VlmConfig {
    /// Patches per side of the vision grid.
    pub fn grid_side(&self) -> usize {
        (self.image_size / self.patch_size.max(1)) as usize
    }

    pub fn validate(&self) -> PenumbraResult<()> {
        if self.patch_size == 0 || self.patch_size > self.image_size {
            return Err(PenumbraError::Config(format!(
                "patch_size must be in [1, image_size], got {} (image_size {})",
                self.patch_size, self.image_size
            )));
        }
        for (name, v) in [
            ("relevance_threshold", self.relevance_threshold),
            ("uncertainty_threshold", self.uncertainty_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(PenumbraError::Config(format!(
                    "{name} must be in [0, 1], got {v}"
                )));
            }
        }
        Ok(())
    }
}

/// Analyzer configuration snapshot, passed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Steps in the uncertainty sliding window. Default: 5.
    pub window_size: usize,

    /// Window mean of normalised semantic entropy above which a span is
    /// reported. Default: 0.45.
    pub window_threshold: f64,

    /// Step quality scores below this produce improvement targets.
    /// Default: 0.5.
    pub quality_floor: f64,

    #[serde(default)]
    pub reasoning_start_token: Option<String>,
    #[serde(default)]
    pub reasoning_end_token: Option<String>,

    #[serde(default)]
    pub vlm: VlmConfig,

    /// Narrative enrichment; `None` produces structural-only reports.
    #[serde(default)]
    pub insight: Option<InsightConfig>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            window_threshold: 0.45,
            quality_floor: 0.5,
            reasoning_start_token: None,
            reasoning_end_token: None,
            vlm: VlmConfig::default(),
            insight: None,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> PenumbraResult<()> {
        if self.window_size < 1 {
            return Err(PenumbraError::Config(format!(
                "window_size must be >= 1, got {}",
                self.window_size
            )));
        }
        if !(0.0..=1.0).contains(&self.window_threshold) {
            return Err(PenumbraError::Config(format!(
                "window_threshold must be in [0, 1], got {}",
                self.window_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.quality_floor) {
            return Err(PenumbraError::Config(format!(
                "quality_floor must be in [0, 1], got {}",
                self.quality_floor
            )));
        }
        match (&self.reasoning_start_token, &self.reasoning_end_token) {
            (Some(s), _) if s.is_empty() => {
                return Err(PenumbraError::Config(
                    "reasoning_start_token must not be empty".to_string(),
                ))
            }
            (_, Some(e)) if e.is_empty() => {
                return Err(PenumbraError::Config(
                    "reasoning_end_token must not be empty".to_string(),
                ))
            }
            _ => {}
        }
        self.vlm.validate()?;
        if let Some(insight) = &self.insight {
            insight.validate()?;
        }
        Ok(())
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> PenumbraResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| PenumbraError::Config(format!("JSON parse error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(CaptureConfig::default().validate().is_ok());
        assert!(AnalyzerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_capture_rejects_zero_top_k() {
        let cfg = CaptureConfig { top_k: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(PenumbraError::Config(_))));
    }

    #[test]
    fn test_capture_rejects_min_prob_one() {
        let cfg = CaptureConfig { min_token_prob: 1.0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_capture_from_json_defaults_mode() {
        let cfg = CaptureConfig::from_json(
            r#"{"top_k": 5, "min_token_prob": 0.0,
                "semantic_similarity_threshold": 0.9, "collapse_delta": 0.05}"#,
        )
        .unwrap();
        assert_eq!(cfg.top_k, 5);
        assert_eq!(cfg.clustering, ClusteringMode::PerStep);
    }

    #[test]
    fn test_from_json_garbage() {
        assert!(matches!(
            AnalyzerConfig::from_json("{nope"),
            Err(PenumbraError::Config(_))
        ));
    }

    #[test]
    fn test_api_key_not_serialised_or_printed() {
        let cfg = InsightConfig {
            model_id: "m".into(),
            api_key: Some("secret-key".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret-key"));
        assert!(!format!("{cfg:?}").contains("secret-key"));
    }

    #[test]
    fn test_insight_requires_model() {
        let cfg = AnalyzerConfig {
            insight: Some(InsightConfig::default()),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let retry = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(retry.base_backoff_ms(0), 100.0);
        assert_eq!(retry.base_backoff_ms(1), 200.0);
        assert_eq!(retry.base_backoff_ms(2), 350.0);
        assert!(retry.should_retry(1));
        assert!(!retry.should_retry(2));
    }

    #[test]
    fn test_vlm_grid_side() {
        let vlm = VlmConfig { image_size: 384, patch_size: 14, ..Default::default() };
        assert_eq!(vlm.grid_side(), 27);
        let bad = VlmConfig { patch_size: 0, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}
