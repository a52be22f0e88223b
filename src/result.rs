//! Per-step and per-run results.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::predictor::{FunctionCall, RunContext};

/// Outcome of one executed step.
///
/// Either `output` is present and `failed` is false, or `error` is present
/// and `failed` is true. Use [`StepResult::success`] and
/// [`StepResult::failure`] to build one.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub output: Option<String>,
    pub structured: Option<Value>,
    pub error: Option<String>,
    pub failed: bool,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub attempts: u32,
    /// Tool call the model asked for before it could finish.
    pub interrupt: Option<FunctionCall>,
}

impl StepResult {
    pub fn success(output: impl Into<String>, structured: Option<Value>) -> Self {
        Self {
            output: Some(output.into()),
            structured,
            error: None,
            failed: false,
            cost: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            attempts: 1,
            interrupt: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: None,
            structured: None,
            error: Some(error.into()),
            failed: true,
            cost: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            attempts: 1,
            interrupt: None,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.interrupt.is_some()
    }

    /// Text shown to callers: the output, or the error for failed steps.
    pub fn display_text(&self) -> &str {
        if self.failed {
            self.error.as_deref().unwrap_or_default()
        } else {
            self.output.as_deref().unwrap_or_default()
        }
    }

    pub(crate) fn with_usage(mut self, cost: f64, input_tokens: u64, output_tokens: u64) -> Self {
        self.cost = cost;
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Summary streamed to the caller after every executed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    pub index: usize,
    pub output: Option<String>,
    pub error: Option<String>,
    pub cost: f64,
    pub duration: Duration,
    /// The step closes a loop and may send the run back to the loop entry.
    pub can_loop: bool,
}

/// Aggregate result of one chain invocation.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub output: Option<String>,
    pub structured: Option<Value>,
    pub error: Option<String>,
    pub failed: bool,
    pub aborted: bool,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration: Duration,
    /// Attempts beyond the first, summed over executed steps.
    pub retries: u32,
    pub steps_executed: usize,
    /// Present when the run paused; pass it back to resume.
    pub continuation_id: Option<String>,
    pub inputs: HashMap<String, String>,
    pub context: RunContext,
}

impl RunResult {
    pub(crate) fn absorb(&mut self, step: &StepResult, elapsed: Duration) {
        self.cost += step.cost;
        self.input_tokens += step.input_tokens;
        self.output_tokens += step.output_tokens;
        self.duration += elapsed;
        self.retries += step.attempts.saturating_sub(1);
        self.steps_executed += 1;
        if step.failed {
            self.failed = true;
            self.error = Some(
                step.error
                    .clone()
                    .unwrap_or_else(|| "Step failed".to_string()),
            );
        } else {
            self.output = step.output.clone();
            self.structured = step.structured.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_failure_are_exclusive() {
        let ok = StepResult::success("hi", None);
        assert!(!ok.failed && ok.output.is_some() && ok.error.is_none());
        let err = StepResult::failure("boom");
        assert!(err.failed && err.output.is_none() && err.error.is_some());
        assert_eq!(err.display_text(), "boom");
    }

    #[test]
    fn interrupt_marks_a_pending_tool_call() {
        let mut step = StepResult::success("{}", None);
        assert!(!step.is_interrupt());
        step.interrupt = Some(FunctionCall {
            id: "c1".into(),
            name: "clock".into(),
            arguments: "{}".into(),
        });
        assert!(step.is_interrupt());
    }

    #[test]
    fn absorb_sums_metrics_and_keeps_last_output() {
        let mut run = RunResult::default();
        run.absorb(
            &StepResult::success("a", None).with_usage(0.5, 10, 5).with_attempts(3),
            Duration::from_millis(5),
        );
        run.absorb(
            &StepResult::success("b", None).with_usage(0.25, 1, 1),
            Duration::from_millis(5),
        );
        assert_eq!(run.output.as_deref(), Some("b"));
        assert_eq!(run.cost, 0.75);
        assert_eq!(run.input_tokens, 11);
        assert_eq!(run.retries, 2);
        assert_eq!(run.steps_executed, 2);
        assert_eq!(run.duration, Duration::from_millis(10));
        assert!(!run.failed);
    }
}
