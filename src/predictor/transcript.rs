//! Flat-transcript predictor for providers without structured history.

use async_trait::async_trait;
use llm::chat::{ChatMessage, ChatProvider, ChatResponse};
use tracing::{debug, warn};

use super::{
    pricing, unless_aborted, PredictRequest, Predictor, ProviderKind, RawPrediction, RunContext,
    JSON_MODE_INSTRUCTION,
};
use crate::api::llm_bridge::{build_provider, BackendSpec};

pub struct TranscriptPredictor {
    kind: ProviderKind,
    base_url: Option<String>,
}

impl TranscriptPredictor {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }
}

/// Transcript before the model's turn: previous text when requested, then
/// the answered function call or the new prompts.
pub(crate) fn build_transcript(req: &PredictRequest<'_>) -> String {
    let mut transcript = if req.use_previous_context {
        req.context.transcript().to_string()
    } else {
        String::new()
    };

    match req.continuation.and_then(|c| c.tool_result()) {
        Some((call, result)) => {
            transcript.push_str(&format!("Function {} returned: {}\n\n", call.name, result));
        }
        None => {
            for prompt in req.prompts {
                transcript.push_str(&format!("{}: {}\n\n", prompt.role.label(), prompt.content));
            }
        }
    }
    if req.model.json_mode {
        transcript.push_str(&format!("System: {}\n\n", JSON_MODE_INSTRUCTION));
    }
    transcript
}

#[async_trait]
impl Predictor for TranscriptPredictor {
    async fn predict(&self, req: PredictRequest<'_>) -> RawPrediction {
        let model = req.model;
        if !model.functions.is_empty() {
            warn!(provider = %self.kind, "function definitions ignored by a transcript provider");
        }

        let mut transcript = build_transcript(&req);
        let request_text = format!("{}Assistant:", transcript);

        let provider = match build_provider(BackendSpec {
            kind: self.kind,
            api_key: req.api_key,
            base_url: self.base_url.as_deref(),
            model,
            system: None,
        }) {
            Ok(p) => p,
            Err(e) => return RawPrediction::failed(e, req.context.clone()),
        };

        let message = ChatMessage::user().content(&request_text).build();
        let response = match unless_aborted(req.abort, provider.chat(&[message])).await {
            None => {
                debug!(provider = %self.kind, "prediction aborted");
                return RawPrediction::aborted(String::new(), req.context.clone());
            }
            Some(Err(e)) => {
                warn!(provider = %self.kind, error = %e, "provider call failed");
                return RawPrediction::failed(e.to_string(), req.context.clone());
            }
            Some(Ok(response)) => response,
        };

        let output = response.text().unwrap_or_default().trim().to_string();
        if !output.is_empty() {
            (req.on_partial)(&output);
        }

        let input_tokens = pricing::count_tokens(&request_text);
        let output_tokens = pricing::count_tokens(&output);
        transcript.push_str(&format!("Assistant: {}\n\n", output));

        RawPrediction {
            cost: pricing::cost(self.kind, &model.model, input_tokens, output_tokens),
            input_tokens,
            output_tokens,
            ..RawPrediction::text(output, RunContext::Transcript { text: transcript })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortSignal;
    use crate::predictor::{Continuation, FunctionCall, ModelConfig, PromptMessage};
    use std::collections::HashMap;

    fn noop(_: &str) {}

    #[test]
    fn transcript_appends_prompts_to_previous_text() {
        let model = ModelConfig::new(ProviderKind::Ollama, "llama3");
        let prompts = vec![PromptMessage::system("be brief"), PromptMessage::user("hi")];
        let context = RunContext::Transcript {
            text: "User: earlier\n\nAssistant: ok\n\n".into(),
        };
        let abort = AbortSignal::new();
        let req = PredictRequest {
            api_key: None,
            model: &model,
            prompts: &prompts,
            context: &context,
            use_previous_context: true,
            continuation: None,
            on_partial: &noop,
            abort: &abort,
        };
        assert_eq!(
            build_transcript(&req),
            "User: earlier\n\nAssistant: ok\n\nSystem: be brief\n\nUser: hi\n\n"
        );
    }

    #[test]
    fn answered_call_replaces_prompts() {
        let model = ModelConfig::new(ProviderKind::Ollama, "llama3");
        let prompts = vec![PromptMessage::user("hi")];
        let call = FunctionCall {
            id: "1".into(),
            name: "clock".into(),
            arguments: "{}".into(),
        };
        let inputs: HashMap<String, String> =
            [("clock".to_string(), "noon".to_string())].into_iter().collect();
        let context = RunContext::Empty;
        let abort = AbortSignal::new();
        let req = PredictRequest {
            api_key: None,
            model: &model,
            prompts: &prompts,
            context: &context,
            use_previous_context: false,
            continuation: Some(Continuation {
                pending: &call,
                inputs: &inputs,
                identifier_casing: false,
            }),
            on_partial: &noop,
            abort: &abort,
        };
        assert_eq!(build_transcript(&req), "Function clock returned: noon\n\n");
    }
}
