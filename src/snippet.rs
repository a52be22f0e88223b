//! Sandboxed snippet execution on an embedded Rhai engine.
//!
//! Each call gets a fresh engine whose scope holds a copy of the current
//! inputs (names normalized). Execution is bounded by a wall-clock timeout
//! and by size ceilings on strings, arrays and maps.

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::utils::normalize_identifier;
use crate::result::StepResult;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_MEMORY_LIMIT: usize = 8 * 1024 * 1024;

/// Grace period on top of the engine's own deadline before the blocking
/// task is abandoned.
const WATCHDOG_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct SnippetLimits {
    pub timeout: Duration,
    pub memory_limit: usize,
}

impl Default for SnippetLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnippetExecutor {
    limits: SnippetLimits,
}

impl SnippetExecutor {
    pub fn new(limits: SnippetLimits) -> Self {
        Self { limits }
    }

    /// Runs `script` against a copy of `inputs`. Never retries; cost is 0.
    pub async fn run(&self, script: &str, inputs: &HashMap<String, String>) -> StepResult {
        let limits = self.limits;
        let script = script.to_string();
        let bindings: Vec<(String, String)> = inputs
            .iter()
            .map(|(k, v)| (normalize_identifier(k), v.clone()))
            .collect();

        let task = tokio::task::spawn_blocking(move || evaluate(&script, bindings, limits));
        let outcome = match tokio::time::timeout(limits.timeout + WATCHDOG_GRACE, task).await {
            Err(_) => Err(timeout_message(limits.timeout)),
            Ok(Err(join)) => Err(format!("Script execution failed: {}", join)),
            Ok(Ok(outcome)) => outcome,
        };

        match outcome {
            Ok(value) => {
                debug!("snippet finished");
                StepResult::success(display_value(&value), Some(value))
            }
            Err(error) => {
                warn!(error = %error, "snippet failed");
                StepResult::failure(error)
            }
        }
    }
}

fn evaluate(
    script: &str,
    bindings: Vec<(String, String)>,
    limits: SnippetLimits,
) -> Result<Value, String> {
    let mut engine = Engine::new();
    engine
        .set_max_string_size(limits.memory_limit)
        .set_max_array_size(limits.memory_limit / 64)
        .set_max_map_size(limits.memory_limit / 64)
        .set_max_call_levels(64)
        .set_max_expr_depths(128, 64);

    let deadline = Instant::now() + limits.timeout;
    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    let mut scope = Scope::new();
    for (name, value) in bindings {
        scope.push(name, value);
    }

    let result = engine
        .eval_with_scope::<Dynamic>(&mut scope, script)
        .map_err(|err| describe_error(*err, limits))?;

    rhai::serde::from_dynamic::<Value>(&result)
        .map_err(|e| format!("Script returned an unsupported value: {}", e))
}

fn describe_error(err: EvalAltResult, limits: SnippetLimits) -> String {
    match err {
        EvalAltResult::ErrorTerminated(..) => timeout_message(limits.timeout),
        EvalAltResult::ErrorDataTooLarge(what, _) => format!(
            "Script exceeded memory limit of {} bytes ({})",
            limits.memory_limit, what
        ),
        other => other.to_string(),
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("Script execution timed out after {} ms", timeout.as_millis())
}

/// Text form of a script result: strings as-is, everything else pretty JSON.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn returns_text_and_structured_value() {
        let exec = SnippetExecutor::default();
        let result = exec
            .run("return input1 + input2", &inputs(&[("input1", "2"), ("input2", "3")]))
            .await;
        assert!(!result.failed);
        assert_eq!(result.output.as_deref(), Some("23"));
        assert_eq!(result.structured, Some(json!("23")));
        assert_eq!(result.cost, 0.0);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn numbers_and_maps_keep_native_shape() {
        let exec = SnippetExecutor::default();
        let number = exec.run("return parse_int(n) * 2", &inputs(&[("n", "21")])).await;
        assert_eq!(number.structured, Some(json!(42)));
        assert_eq!(number.output.as_deref(), Some("42"));

        let map = exec.run("#{ ok: true }", &HashMap::new()).await;
        assert_eq!(map.structured, Some(json!({"ok": true})));
        assert!(map.output.unwrap().contains("\"ok\": true"));
    }

    #[tokio::test]
    async fn input_names_are_normalized() {
        let exec = SnippetExecutor::default();
        let result = exec.run("user_name", &inputs(&[("userName", "ada")])).await;
        assert_eq!(result.output.as_deref(), Some("ada"));
    }

    #[tokio::test]
    async fn thrown_errors_fail_the_step() {
        let exec = SnippetExecutor::default();
        let result = exec.run(r#"throw "bad input""#, &HashMap::new()).await;
        assert!(result.failed);
        assert!(result.error.unwrap().contains("bad input"));
    }

    #[tokio::test]
    async fn infinite_loops_time_out() {
        let exec = SnippetExecutor::new(SnippetLimits {
            timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let result = exec.run("loop { }", &HashMap::new()).await;
        assert!(result.failed);
        assert_eq!(
            result.error.as_deref(),
            Some("Script execution timed out after 50 ms")
        );
    }

    #[tokio::test]
    async fn oversized_strings_hit_memory_limit() {
        let exec = SnippetExecutor::new(SnippetLimits {
            memory_limit: 1024,
            ..Default::default()
        });
        let result = exec
            .run(r#"let s = "x"; loop { s += s; }"#, &HashMap::new())
            .await;
        assert!(result.failed);
        assert!(result.error.unwrap().contains("memory limit"));
    }

    #[tokio::test]
    async fn scripts_cannot_mutate_caller_inputs() {
        let exec = SnippetExecutor::default();
        let vars = inputs(&[("a", "1")]);
        let result = exec.run(r#"a = "changed"; a"#, &vars).await;
        assert_eq!(result.output.as_deref(), Some("changed"));
        assert_eq!(vars["a"], "1");
    }
}
