// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Penumbra Error Hierarchy
// ─────────────────────────────────────────────────────────────────────

use thiserror::Error;

/// Root error type for all Penumbra failures.
///
/// Fatal kinds (`InvalidDistribution`, `Sequence`, `MissingModality`,
/// `Config`) reach the caller. The remaining kinds are recovered inside
/// the kernel and only lower a report's severity flag.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PenumbraError {
    /// Malformed, empty or non-finite score vector for one step.
    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),

    /// Out-of-order ingest, ingest after finalize, or analysis of an
    /// unfinalized / invalid trace.
    #[error("sequence error: {0}")]
    Sequence(String),

    /// A modality the analyzer variant needs was not supplied.
    #[error("missing modality: {0}")]
    MissingModality(String),

    /// Embedding capability absent or failing (singleton fallback).
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Insight generator did not answer within its deadline.
    #[error("timeout: insight generator exceeded {timeout_ms}ms deadline")]
    InsightTimeout { timeout_ms: u64 },

    /// Insight generator returned an error.
    #[error("insight generator error: {0}")]
    InsightGenerator(String),

    /// Insight generator answered with text that does not fit the schema.
    #[error("malformed insight output: {0}")]
    MalformedInsightOutput(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Numerical error (NaN/Inf in computation).
    #[error("numerical error: {0}")]
    Numerical(String),
}

impl PenumbraError {
    /// True for kinds that degrade a report instead of failing the call.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            PenumbraError::EmbeddingUnavailable(_)
                | PenumbraError::InsightTimeout { .. }
                | PenumbraError::InsightGenerator(_)
                | PenumbraError::MalformedInsightOutput(_)
        )
    }
}

pub type PenumbraResult<T> = Result<T, PenumbraError>;
