// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Analysis Lifecycle
// ─────────────────────────────────────────────────────────────────────
//! Per-call state machine:
//! `Capturing → Finalizing → Analyzing → Reported | Failed`.
//!
//! A trace that is still capturing can never reach `Analyzing`.

use penumbra_types::{GenerationTrace, PenumbraError, PenumbraResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisPhase {
    Capturing,
    Finalizing,
    Analyzing,
    Reported,
    Failed,
}

impl AnalysisPhase {
    pub fn can_transition_to(self, next: AnalysisPhase) -> bool {
        use AnalysisPhase::*;
        matches!(
            (self, next),
            (Capturing, Finalizing)
                | (Finalizing, Analyzing)
                | (Finalizing, Failed)
                | (Analyzing, Reported)
                | (Analyzing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AnalysisPhase::Reported | AnalysisPhase::Failed)
    }
}

/// Tracks one `analyze` call through its phases.
#[derive(Debug)]
pub struct PhaseTracker {
    analyzer: &'static str,
    phase: AnalysisPhase,
}

impl PhaseTracker {
    pub fn new(analyzer: &'static str) -> Self {
        Self { analyzer, phase: AnalysisPhase::Capturing }
    }

    pub fn phase(&self) -> AnalysisPhase {
        self.phase
    }

    pub fn advance(&mut self, next: AnalysisPhase) -> PenumbraResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(PenumbraError::Sequence(format!(
                "{}: illegal transition {:?} -> {next:?}",
                self.analyzer, self.phase
            )));
        }
        log::debug!("{}: {:?} -> {next:?}", self.analyzer, self.phase);
        self.phase = next;
        Ok(())
    }

    /// Check the trace and move to `Analyzing`.
    ///
    /// Open, malformed and empty traces are `Sequence` errors.
    pub fn enter_analysis(&mut self, trace: &GenerationTrace) -> PenumbraResult<()> {
        if !trace.is_finalized() {
            return Err(PenumbraError::Sequence(format!(
                "{}: trace is still capturing; finalize before analysis",
                self.analyzer
            )));
        }
        self.advance(AnalysisPhase::Finalizing)?;
        trace.validate()?;
        if trace.is_empty() {
            return Err(PenumbraError::Sequence(format!(
                "{}: trace has no steps to analyze",
                self.analyzer
            )));
        }
        self.advance(AnalysisPhase::Analyzing)
    }

    /// Record a failure. No-op once the call has already ended.
    pub fn fail(&mut self, err: &PenumbraError) {
        if self.phase.is_terminal() {
            return;
        }
        log::warn!("{}: analysis failed in {:?}: {err}", self.analyzer, self.phase);
        self.phase = AnalysisPhase::Failed;
    }
}

/// Run `body` inside the lifecycle: enter analysis, then report or fail.
pub(crate) fn run_analysis<T>(
    analyzer: &'static str,
    trace: &GenerationTrace,
    body: impl FnOnce() -> PenumbraResult<T>,
) -> PenumbraResult<T> {
    let mut tracker = PhaseTracker::new(analyzer);
    let outcome = tracker.enter_analysis(trace).and_then(|()| body());
    match outcome {
        Ok(value) => {
            tracker.advance(AnalysisPhase::Reported)?;
            Ok(value)
        }
        Err(e) => {
            tracker.fail(&e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use penumbra_types::{TracePhase, TraceSummary};

    fn trace(phase: TracePhase) -> GenerationTrace {
        GenerationTrace {
            phase,
            prompt: "p".into(),
            generated_text: String::new(),
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

    #[test]
    fn test_legal_path() {
        let mut t = PhaseTracker::new("test");
        t.advance(AnalysisPhase::Finalizing).unwrap();
        t.advance(AnalysisPhase::Analyzing).unwrap();
        t.advance(AnalysisPhase::Reported).unwrap();
        assert!(t.phase().is_terminal());
    }

    #[test]
    fn test_cannot_skip_finalizing() {
        let mut t = PhaseTracker::new("test");
        assert!(matches!(
            t.advance(AnalysisPhase::Analyzing),
            Err(PenumbraError::Sequence(_))
        ));
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        assert!(!AnalysisPhase::Reported.can_transition_to(AnalysisPhase::Analyzing));
        assert!(!AnalysisPhase::Failed.can_transition_to(AnalysisPhase::Reported));
    }

    #[test]
    fn test_capturing_trace_rejected() {
        let mut t = PhaseTracker::new("test");
        assert!(matches!(
            t.enter_analysis(&trace(TracePhase::Capturing)),
            Err(PenumbraError::Sequence(_))
        ));
        assert_eq!(t.phase(), AnalysisPhase::Capturing);
    }

    #[test]
    fn test_empty_trace_rejected() {
        let mut t = PhaseTracker::new("test");
        assert!(t.enter_analysis(&trace(TracePhase::Finalized)).is_err());
        assert_eq!(t.phase(), AnalysisPhase::Finalizing);
    }

    #[test]
    fn test_run_analysis_marks_failure() {
        let r: PenumbraResult<()> = run_analysis("test", &trace(TracePhase::Finalized), || Ok(()));
        assert!(r.is_err());
    }
}
