//! Prompt steps: credential checks, retry on empty output, cost metering.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::metering::{CostMeter, Credentials, ProviderKey, Scope};
use crate::predictor::{
    pricing, validate_functions, Continuation, ModelConfig, PartialSink, PredictRequest,
    PredictorSet, PromptMessage, RunContext,
};
use crate::result::StepResult;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const EMPTY_RESPONSE: &str = "Received empty prediction response";

/// Inputs of a single prompt step call.
pub struct PromptCall<'a> {
    pub scope: &'a Scope,
    pub prompts: &'a [PromptMessage],
    pub model: &'a ModelConfig,
    pub context: &'a RunContext,
    pub use_previous_context: bool,
    pub on_partial: PartialSink<'a>,
    pub abort: &'a AbortSignal,
    pub continuation: Option<Continuation<'a>>,
}

pub struct PromptStepExecutor {
    predictors: PredictorSet,
    credentials: Arc<dyn Credentials>,
    meter: Arc<dyn CostMeter>,
    max_attempts: u32,
}

impl PromptStepExecutor {
    pub fn new(
        predictors: PredictorSet,
        credentials: Arc<dyn Credentials>,
        meter: Arc<dyn CostMeter>,
    ) -> Self {
        Self {
            predictors,
            credentials,
            meter,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Runs one prompt step and returns its result with the running context
    /// to carry forward. The context is unchanged when the step fails.
    pub async fn run(&self, call: PromptCall<'_>) -> (StepResult, RunContext) {
        let model = call.model;
        let unchanged = || call.context.clone();

        if let Err(e) = validate_functions(&model.functions) {
            return (StepResult::failure(e), unchanged());
        }
        let Some(predictor) = self.predictors.get(model.provider) else {
            return (StepResult::failure("Unsupported model"), unchanged());
        };

        let key = self.credentials.provider_key(call.scope, model.provider);
        if model.provider.requires_key() {
            match &key {
                None => return (StepResult::failure("Missing API key"), unchanged()),
                Some(ProviderKey::PlatformDefault(_))
                    if !pricing::is_catalogued(model.provider, &model.model) =>
                {
                    return (StepResult::failure("Unsupported model"), unchanged());
                }
                Some(_) => {}
            }
        }
        if !self.meter.has_budget(call.scope).await {
            return (StepResult::failure("Budget exhausted"), unchanged());
        }

        let mut cost = 0.0;
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        let mut attempt = 0;
        let (result, context) = loop {
            attempt += 1;
            let raw = predictor
                .predict(PredictRequest {
                    api_key: key.as_ref().map(ProviderKey::secret),
                    model,
                    prompts: call.prompts,
                    context: call.context,
                    use_previous_context: call.use_previous_context,
                    continuation: call.continuation,
                    on_partial: call.on_partial,
                    abort: call.abort,
                })
                .await;
            cost += raw.cost;
            input_tokens += raw.input_tokens;
            output_tokens += raw.output_tokens;

            if let Some(error) = raw.error {
                warn!(provider = %model.provider, attempt, error = %error, "prediction failed");
                break (StepResult::failure(error), unchanged());
            }
            if raw.aborted {
                debug!(
                    provider = %model.provider,
                    attempt,
                    "prediction aborted; keeping partial output"
                );
                let structured = structured_output(&raw.output);
                break (StepResult::success(raw.output, structured), unchanged());
            }
            if raw.output.trim().is_empty() && raw.interrupt.is_none() {
                if attempt < self.max_attempts {
                    debug!(provider = %model.provider, attempt, "empty prediction; retrying");
                    continue;
                }
                warn!(provider = %model.provider, attempt, "empty prediction; giving up");
                break (StepResult::failure(EMPTY_RESPONSE), unchanged());
            }

            let structured = structured_output(&raw.output);
            let mut result = StepResult::success(raw.output, structured);
            result.interrupt = raw.interrupt;
            break (result, raw.context);
        };

        if cost > 0.0 {
            self.meter.record(call.scope, cost).await;
        }
        info!(
            provider = %model.provider,
            model = %model.model,
            attempts = attempt,
            cost,
            failed = result.failed,
            interrupted = result.is_interrupt(),
            "prompt step finished"
        );

        (
            result
                .with_usage(cost, input_tokens, output_tokens)
                .with_attempts(attempt),
            context,
        )
    }
}

/// Portable structured form of model output: parsed JSON, else the text.
fn structured_output(output: &str) -> Option<Value> {
    Some(
        serde_json::from_str::<Value>(output.trim())
            .unwrap_or_else(|_| Value::String(output.to_string())),
    )
}
