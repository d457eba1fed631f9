// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Insight Generator Interface
// ─────────────────────────────────────────────────────────────────────
//! Optional narrative enrichment.
//!
//! An `InsightGenerator` turns a structured request into free text,
//! usually by calling a hosted language model. The kernel never depends
//! on it: `InsightClient` bounds every attempt with a hard deadline,
//! retries transient failures with jittered backoff, and reports
//! anything it cannot use as an `EnrichmentFailure` that only degrades
//! the report.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use penumbra_types::report::{ImprovementTarget, Issue, Suggestion, UncertainPart};
use penumbra_types::{GenerationTrace, InsightConfig, PenumbraError, PenumbraResult};

/// Bumped whenever `InsightRequest` changes shape.
pub const INSIGHT_SCHEMA_VERSION: u32 = 1;

/// Structured request handed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRequest {
    pub schema_version: u32,
    /// `entropy`, `reasoning` or `vlm`.
    pub variant: String,
    pub model_id: String,
    pub prompt: String,
    pub generated_text: String,
    /// Structural findings the narrative should explain.
    pub summary: serde_json::Value,
    /// Rendered instruction for text-in/text-out generators.
    pub instruction: String,
}

/// Trait for narrative backends.
///
/// `connection` carries the endpoint, model and credentials from
/// `AnalyzerConfig::insight`; the key never travels inside the request.
pub trait InsightGenerator: Send + Sync {
    fn generate(&self, request: &InsightRequest, connection: &InsightConfig) -> PenumbraResult<String>;
}

type GenerateFn =
    Box<dyn Fn(&InsightRequest, &InsightConfig) -> Result<String, String> + Send + Sync>;

/// Generator that calls a host function (HTTP client, local model, ...).
pub struct ExternalInsight {
    generate_fn: GenerateFn,
}

impl ExternalInsight {
    pub fn new(
        generate_fn: impl Fn(&InsightRequest, &InsightConfig) -> Result<String, String>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self { generate_fn: Box::new(generate_fn) }
    }
}

impl InsightGenerator for ExternalInsight {
    fn generate(&self, request: &InsightRequest, connection: &InsightConfig) -> PenumbraResult<String> {
        (self.generate_fn)(request, connection).map_err(PenumbraError::InsightGenerator)
    }
}

/// Improvement targets the generator proposes for one reasoning step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepTargets {
    pub step_number: usize,
    #[serde(default)]
    pub improvement_targets: Vec<ImprovementTarget>,
}

/// Decoded generator reply. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InsightPayload {
    pub high_uncertainty_parts: Vec<UncertainPart>,
    pub main_issues: Vec<Issue>,
    pub key_suggestions: Vec<Suggestion>,
    pub steps: Vec<StepTargets>,
    pub missed_regions: Vec<String>,
}

impl InsightPayload {
    pub fn is_empty(&self) -> bool {
        self.high_uncertainty_parts.is_empty()
            && self.main_issues.is_empty()
            && self.key_suggestions.is_empty()
            && self.steps.is_empty()
            && self.missed_regions.is_empty()
    }
}

/// Why enrichment produced nothing usable.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentFailure {
    pub error: PenumbraError,
    /// Reply text when the generator answered but could not be parsed.
    pub raw_text: Option<String>,
}

/// Deadline- and retry-bounded access to an `InsightGenerator`.
#[derive(Clone)]
pub struct InsightClient {
    generator: Arc<dyn InsightGenerator>,
    config: InsightConfig,
}

impl InsightClient {
    pub fn new(generator: Arc<dyn InsightGenerator>, config: InsightConfig) -> Self {
        Self { generator, config }
    }

    pub fn config(&self) -> &InsightConfig {
        &self.config
    }

    pub fn request(
        &self,
        variant: &str,
        trace: &GenerationTrace,
        summary: serde_json::Value,
    ) -> InsightRequest {
        let instruction = render_instruction(variant, trace, &summary);
        InsightRequest {
            schema_version: INSIGHT_SCHEMA_VERSION,
            variant: variant.to_string(),
            model_id: self.config.model_id.clone(),
            prompt: trace.prompt.clone(),
            generated_text: trace.generated_text.clone(),
            summary,
            instruction,
        }
    }

    /// Ask the generator, retrying timeouts and generator errors.
    ///
    /// Malformed replies are not retried.
    pub fn enrich(&self, request: &InsightRequest) -> Result<InsightPayload, EnrichmentFailure> {
        let mut attempt = 0u32;
        loop {
            match self.attempt(request) {
                Ok(text) => {
                    return parse_payload(&text)
                        .map_err(|error| EnrichmentFailure { error, raw_text: Some(text) })
                }
                Err(error) => {
                    if !self.config.retry.should_retry(attempt) {
                        log::warn!(
                            "insight generator gave up after {} attempt(s): {error}",
                            attempt + 1
                        );
                        return Err(EnrichmentFailure { error, raw_text: None });
                    }
                    let delay = self.backoff_for_attempt(attempt);
                    log::info!(
                        "insight attempt {} failed: {error}; retrying in {}ms",
                        attempt + 1,
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// One call on a worker thread, abandoned after `timeout_ms`.
    fn attempt(&self, request: &InsightRequest) -> PenumbraResult<String> {
        let (tx, rx) = mpsc::channel();
        let generator = Arc::clone(&self.generator);
        let request = request.clone();
        let connection = self.config.clone();
        thread::Builder::new()
            .name("penumbra-insight".to_string())
            .spawn(move || {
                // The receiver is gone when the deadline already passed.
                let _ = tx.send(generator.generate(&request, &connection));
            })
            .map_err(|e| PenumbraError::InsightGenerator(format!("cannot spawn worker: {e}")))?;

        match rx.recv_timeout(self.config.timeout()) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PenumbraError::InsightTimeout {
                timeout_ms: self.config.timeout_ms,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(PenumbraError::InsightGenerator(
                "worker exited without a reply".to_string(),
            )),
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let retry = &self.config.retry;
        let capped = retry.base_backoff_ms(attempt);
        let jitter_range = capped * retry.jitter;
        let jitter_offset = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        Duration::from_millis((capped + jitter_offset).max(0.0) as u64)
    }
}

fn render_instruction(variant: &str, trace: &GenerationTrace, summary: &serde_json::Value) -> String {
    let focus = match variant {
        "reasoning" => {
            "For each reasoning step, propose improvement_targets \
             ({aspect, importance: low|medium|high, current_issue, training_suggestion}) \
             under steps[{step_number, improvement_targets}]."
        }
        "vlm" => {
            "Explain where the visual attention drifted from the words it grounds, \
             and list any missed_regions."
        }
        _ => "Explain what the model was unsure about and why.",
    };
    format!(
        "You are reviewing token-level uncertainty of a generative model.\n\
         Prompt: {prompt}\n\
         Output: {output}\n\
         Structural findings (JSON): {summary}\n\n\
         {focus}\n\
         Answer with a single JSON object with main_issues [{{issue, evidence}}] \
         and key_suggestions [{{what, how}}].",
        prompt = trace.prompt,
        output = trace.generated_text,
    )
}

/// Decode the first `{` .. last `}` block of a reply.
///
/// Accepts the fields at the top level or nested under
/// `uncertainty_analysis`, `reasoning_analysis` and `visual_analysis`.
pub fn parse_payload(text: &str) -> PenumbraResult<InsightPayload> {
    let (start, end) = match (text.find('{'), text.rfind('}')) {
        (Some(s), Some(e)) if e > s => (s, e),
        _ => {
            return Err(PenumbraError::MalformedInsightOutput(
                "reply contains no JSON object".to_string(),
            ))
        }
    };
    let value: serde_json::Value = serde_json::from_str(&text[start..=end])
        .map_err(|e| PenumbraError::MalformedInsightOutput(format!("invalid JSON: {e}")))?;
    let serde_json::Value::Object(mut root) = value else {
        return Err(PenumbraError::MalformedInsightOutput(
            "reply is not a JSON object".to_string(),
        ));
    };

    if let Some(serde_json::Value::Object(nested)) = root.remove("uncertainty_analysis") {
        for (k, v) in nested {
            root.entry(k).or_insert(v);
        }
    }
    if let Some(steps) = root
        .get_mut("reasoning_analysis")
        .and_then(|r| r.get_mut("steps"))
        .map(serde_json::Value::take)
    {
        root.entry("steps").or_insert(steps);
    }
    if let Some(missed) = root
        .get_mut("visual_analysis")
        .and_then(|v| v.get_mut("attention_quality"))
        .and_then(|q| q.get_mut("missed_regions"))
        .map(serde_json::Value::take)
    {
        root.entry("missed_regions").or_insert(missed);
    }

    let payload: InsightPayload = serde_json::from_value(serde_json::Value::Object(root))
        .map_err(|e| PenumbraError::MalformedInsightOutput(format!("schema mismatch: {e}")))?;
    if payload.is_empty() {
        return Err(PenumbraError::MalformedInsightOutput(
            "reply carries no insight fields".to_string(),
        ));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use penumbra_types::{RetryConfig, TracePhase, TraceSummary};

    fn trace() -> GenerationTrace {
        GenerationTrace {
            phase: TracePhase::Finalized,
            prompt: "Capital of France?".into(),
            generated_text: "Paris".into(),
            steps: Vec::new(),
            top_k: 5,
            image: None,
            attention: None,
            delimiters: None,
            truncated: false,
            summary: TraceSummary::default(),
            token_spans: Vec::new(),
        }
    }

    fn fast_config(timeout_ms: u64, max_retries: u32) -> InsightConfig {
        InsightConfig {
            model_id: "narrator".into(),
            timeout_ms,
            retry: RetryConfig {
                max_retries,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    const GOOD: &str = r#"{"main_issues":[{"issue":"hedging","evidence":"step 3"}]}"#;

    #[test]
    fn test_parse_flat() {
        let p = parse_payload(GOOD).unwrap();
        assert_eq!(p.main_issues[0].issue, "hedging");
    }

    #[test]
    fn test_parse_nested_with_prose() {
        let text = r#"Sure! Here it is:
        {"uncertainty_analysis": {"key_suggestions": [{"what": "cite", "how": "add source"}]}}
        Hope that helps."#;
        let p = parse_payload(text).unwrap();
        assert_eq!(p.key_suggestions[0].what, "cite");
    }

    #[test]
    fn test_parse_reasoning_steps_nested() {
        let text = r#"{"reasoning_analysis":{"steps":[{"step_number":1,"improvement_targets":[
            {"aspect":"rigor","importance":"high","current_issue":"skips a case","training_suggestion":"more proofs"}]}]}}"#;
        let p = parse_payload(text).unwrap();
        assert_eq!(p.steps[0].step_number, 1);
        assert_eq!(p.steps[0].improvement_targets[0].aspect, "rigor");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_payload("no json here"),
            Err(PenumbraError::MalformedInsightOutput(_))
        ));
        assert!(parse_payload("{not json}").is_err());
        assert!(parse_payload("{}").is_err());
        assert!(parse_payload(r#"{"main_issues": "oops"}"#).is_err());
    }

    #[test]
    fn test_request_shape() {
        let client = InsightClient::new(Arc::new(ExternalInsight::new(|_, _| Ok(GOOD.into()))), fast_config(1000, 0));
        let req = client.request("entropy", &trace(), serde_json::json!({"mean": 0.4}));
        assert_eq!(req.schema_version, INSIGHT_SCHEMA_VERSION);
        assert_eq!(req.model_id, "narrator");
        assert!(req.instruction.contains("Capital of France?"));
        assert!(req.instruction.contains("\"mean\""));
    }

    #[test]
    fn test_enrich_success() {
        let client = InsightClient::new(Arc::new(ExternalInsight::new(|_, _| Ok(GOOD.into()))), fast_config(1000, 0));
        let req = client.request("entropy", &trace(), serde_json::Value::Null);
        assert_eq!(client.enrich(&req).unwrap().main_issues.len(), 1);
    }

    #[test]
    fn test_generator_receives_endpoint_and_key() {
        let gen = ExternalInsight::new(|req, connection| {
            if connection.endpoint != "https://narrator.local/v1" {
                return Err(format!("wrong endpoint {:?}", connection.endpoint));
            }
            if connection.api_key.as_deref() != Some("k-123") {
                return Err("missing key".into());
            }
            assert_eq!(req.model_id, connection.model_id);
            Ok(GOOD.into())
        });
        let config = InsightConfig {
            endpoint: "https://narrator.local/v1".into(),
            api_key: Some("k-123".into()),
            ..fast_config(1000, 0)
        };
        let client = InsightClient::new(Arc::new(gen), config);
        let req = client.request("entropy", &trace(), serde_json::Value::Null);
        assert!(client.enrich(&req).is_ok());
        let wire = serde_json::to_string(&req).unwrap();
        assert!(!wire.contains("k-123"));
    }

    #[test]
    fn test_retry_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let gen = ExternalInsight::new(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("503".into())
            } else {
                Ok(GOOD.into())
            }
        });
        let client = InsightClient::new(Arc::new(gen), fast_config(1000, 2));
        let req = client.request("entropy", &trace(), serde_json::Value::Null);
        assert!(client.enrich(&req).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retries_exhausted() {
        let client = InsightClient::new(
            Arc::new(ExternalInsight::new(|_, _| Err("down".into()))),
            fast_config(1000, 1),
        );
        let req = client.request("entropy", &trace(), serde_json::Value::Null);
        let failure = client.enrich(&req).unwrap_err();
        assert!(matches!(failure.error, PenumbraError::InsightGenerator(_)));
        assert!(failure.raw_text.is_none());
    }

    #[test]
    fn test_timeout() {
        let gen = ExternalInsight::new(|_, _| {
            thread::sleep(Duration::from_millis(300));
            Ok(GOOD.into())
        });
        let client = InsightClient::new(Arc::new(gen), fast_config(20, 0));
        let req = client.request("entropy", &trace(), serde_json::Value::Null);
        let failure = client.enrich(&req).unwrap_err();
        assert_eq!(failure.error, PenumbraError::InsightTimeout { timeout_ms: 20 });
    }

    #[test]
    fn test_malformed_keeps_raw_text_and_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let gen = ExternalInsight::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("I think it was fine.".into())
        });
        let client = InsightClient::new(Arc::new(gen), fast_config(1000, 3));
        let req = client.request("entropy", &trace(), serde_json::Value::Null);
        let failure = client.enrich(&req).unwrap_err();
        assert_eq!(failure.raw_text.as_deref(), Some("I think it was fine."));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_without_jitter() {
        let client = InsightClient::new(
            Arc::new(ExternalInsight::new(|_, _| Ok(String::new()))),
            InsightConfig {
                retry: RetryConfig { jitter: 0.0, ..Default::default() },
                ..fast_config(10, 2)
            },
        );
        assert_eq!(client.backoff_for_attempt(0), Duration::from_millis(200));
        assert_eq!(client.backoff_for_attempt(1), Duration::from_millis(400));
        assert_eq!(client.backoff_for_attempt(10), Duration::from_millis(2000));
    }
}
