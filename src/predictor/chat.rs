//! Message-history predictor: structured turns and tool calling.

use async_trait::async_trait;
use futures::StreamExt;
use llm::chat::{ChatMessage, ChatProvider, ChatResponse};
use llm::LLMProvider;
use tracing::{debug, warn};

use super::{
    canonical_text, pricing, unless_aborted, ContextMessage, PredictRequest, Predictor,
    ProviderKind, RawPrediction, Role, RunContext, JSON_MODE_INSTRUCTION,
};
use crate::api::llm_bridge::{
    build_provider, from_tool_call, to_chat_messages, to_tools, BackendSpec,
};

pub struct ChatPredictor {
    kind: ProviderKind,
    base_url: Option<String>,
}

impl ChatPredictor {
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

/// Builds the history sent to the provider: previous turns when requested,
/// then either the tool result answering a pending call or the new prompts.
pub(crate) fn build_history(req: &PredictRequest<'_>) -> Vec<ContextMessage> {
    let mut history: Vec<ContextMessage> = if req.use_previous_context {
        req.context.messages().to_vec()
    } else {
        Vec::new()
    };

    match req.continuation.and_then(|c| c.tool_result()) {
        Some((call, result)) => {
            let already_requested = history
                .iter()
                .any(|m| m.tool_calls.iter().any(|c| c.id == call.id));
            if !already_requested {
                history.push(ContextMessage::assistant("", vec![call.clone()]));
            }
            history.push(ContextMessage::tool_result(call, result));
        }
        None => history.extend(req.prompts.iter().map(ContextMessage::from)),
    }
    history
}

fn system_prompt(history: &[ContextMessage], json_mode: bool) -> Option<String> {
    let mut parts: Vec<&str> = history
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    if json_mode {
        parts.push(JSON_MODE_INSTRUCTION);
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

#[async_trait]
impl Predictor for ChatPredictor {
    async fn predict(&self, req: PredictRequest<'_>) -> RawPrediction {
        let mut history = build_history(&req);
        let model = req.model;

        if let Some(seed) = model.seed {
            debug!(provider = %self.kind, seed, "seed is not forwarded by this backend");
        }

        let provider = match build_provider(BackendSpec {
            kind: self.kind,
            api_key: req.api_key,
            base_url: self.base_url.as_deref(),
            model,
            system: system_prompt(&history, model.json_mode),
        }) {
            Ok(p) => p,
            Err(e) => return RawPrediction::failed(e, req.context.clone()),
        };

        let messages = to_chat_messages(&history);
        let input_tokens: u64 = history
            .iter()
            .map(|m| pricing::count_tokens(&m.content))
            .sum();

        let outcome = if model.functions.is_empty() {
            stream_text(provider.as_ref(), &messages, &req).await
        } else {
            call_with_tools(provider.as_ref(), &messages, &req).await
        };

        let (text, interrupt) = match outcome {
            Outcome::Done { text, interrupt } => (text, interrupt),
            Outcome::Aborted { partial } => {
                debug!(provider = %self.kind, "prediction aborted");
                return RawPrediction::aborted(partial, req.context.clone());
            }
            Outcome::Failed(error) => {
                warn!(provider = %self.kind, error = %error, "provider call failed");
                return RawPrediction::failed(error, req.context.clone());
            }
        };

        let output = match &interrupt {
            Some(call) => canonical_text(call),
            None => text.clone(),
        };
        let output_tokens = pricing::count_tokens(&output);
        history.push(ContextMessage::assistant(
            text,
            interrupt.iter().cloned().collect(),
        ));

        RawPrediction {
            cost: pricing::cost(self.kind, &model.model, input_tokens, output_tokens),
            input_tokens,
            output_tokens,
            interrupt,
            context: RunContext::Messages { messages: history },
            ..RawPrediction::text(output, RunContext::Empty)
        }
    }
}

enum Outcome {
    Done {
        text: String,
        interrupt: Option<super::FunctionCall>,
    },
    Aborted {
        partial: String,
    },
    Failed(String),
}

async fn stream_text(
    provider: &dyn LLMProvider,
    messages: &[ChatMessage],
    req: &PredictRequest<'_>,
) -> Outcome {
    let mut stream = match unless_aborted(req.abort, provider.chat_stream(messages)).await {
        None => return Outcome::Aborted { partial: String::new() },
        Some(Err(e)) => return Outcome::Failed(e.to_string()),
        Some(Ok(stream)) => stream,
    };

    let mut text = String::new();
    loop {
        let next = match unless_aborted(req.abort, stream.next()).await {
            None => return Outcome::Aborted { partial: text },
            Some(next) => next,
        };
        match next {
            Some(Ok(delta)) => {
                if !delta.is_empty() {
                    (req.on_partial)(&delta);
                    text.push_str(&delta);
                }
            }
            Some(Err(e)) => return Outcome::Failed(e.to_string()),
            None => break,
        }
    }
    Outcome::Done {
        text,
        interrupt: None,
    }
}

async fn call_with_tools(
    provider: &dyn LLMProvider,
    messages: &[ChatMessage],
    req: &PredictRequest<'_>,
) -> Outcome {
    let tools = to_tools(&req.model.functions);
    let response =
        match unless_aborted(req.abort, provider.chat_with_tools(messages, Some(&tools))).await {
            None => return Outcome::Aborted { partial: String::new() },
            Some(Err(e)) => return Outcome::Failed(e.to_string()),
            Some(Ok(response)) => response,
        };

    let text = response.text().unwrap_or_default();
    let calls = response.tool_calls().unwrap_or_default();
    if calls.len() > 1 {
        debug!(count = calls.len(), "model requested several tool calls; resuming on the first");
    }
    let interrupt = calls.first().map(from_tool_call);

    match &interrupt {
        Some(call) => (req.on_partial)(&canonical_text(call)),
        None if !text.is_empty() => (req.on_partial)(&text),
        None => {}
    }
    Outcome::Done { text, interrupt }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortSignal;
    use crate::predictor::{Continuation, FunctionCall, ModelConfig, PromptMessage};
    use std::collections::HashMap;

    fn noop(_: &str) {}

    #[test]
    fn history_includes_previous_turns_only_when_asked() {
        let model = ModelConfig::new(ProviderKind::OpenAI, "gpt-4o-mini");
        let prompts = vec![PromptMessage::user("second")];
        let context = RunContext::Messages {
            messages: vec![ContextMessage::from(&PromptMessage::user("first"))],
        };
        let abort = AbortSignal::new();
        let mut req = PredictRequest {
            api_key: None,
            model: &model,
            prompts: &prompts,
            context: &context,
            use_previous_context: false,
            continuation: None,
            on_partial: &noop,
            abort: &abort,
        };
        assert_eq!(build_history(&req).len(), 1);
        req.use_previous_context = true;
        let history = build_history(&req);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first");
    }

    #[test]
    fn pending_call_with_value_becomes_tool_turn() {
        let model = ModelConfig::new(ProviderKind::OpenAI, "gpt-4o-mini");
        let prompts = vec![PromptMessage::user("ignored while resuming")];
        let call = FunctionCall {
            id: "c1".into(),
            name: "weather".into(),
            arguments: "{}".into(),
        };
        let context = RunContext::Messages {
            messages: vec![
                ContextMessage::from(&PromptMessage::user("what's the weather?")),
                ContextMessage::assistant("", vec![call.clone()]),
            ],
        };
        let inputs: HashMap<String, String> =
            [("weather".to_string(), "sunny".to_string())].into_iter().collect();
        let abort = AbortSignal::new();
        let req = PredictRequest {
            api_key: None,
            model: &model,
            prompts: &prompts,
            context: &context,
            use_previous_context: true,
            continuation: Some(Continuation {
                pending: &call,
                inputs: &inputs,
                identifier_casing: false,
            }),
            on_partial: &noop,
            abort: &abort,
        };
        let history = build_history(&req);
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].role, Role::Tool);
        assert_eq!(history[2].content, "sunny");
        assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn json_mode_extends_system_prompt() {
        let history = vec![ContextMessage::from(&PromptMessage::system("be brief"))];
        let system = system_prompt(&history, true).unwrap();
        assert!(system.starts_with("be brief"));
        assert!(system.ends_with(JSON_MODE_INSTRUCTION));
        assert_eq!(system_prompt(&[], false), None);
    }
}
