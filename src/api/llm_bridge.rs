//! Bridge types for interoperability with the `llm` crate.

use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::{ChatMessage, FunctionTool, Tool};
use llm::{FunctionCall as LlmFunctionCall, LLMProvider, ToolCall};
use std::str::FromStr;

use crate::predictor::{
    ContextMessage, FunctionCall, FunctionSpec, ModelConfig, ProviderKind, Role,
};

/// Connection settings for one provider call.
pub(crate) struct BackendSpec<'a> {
    pub kind: ProviderKind,
    pub api_key: Option<&'a str>,
    pub base_url: Option<&'a str>,
    pub model: &'a ModelConfig,
    pub system: Option<String>,
}

/// Builds a fresh provider client for a single call.
pub(crate) fn build_provider(spec: BackendSpec<'_>) -> Result<Box<dyn LLMProvider>, String> {
    let backend = LLMBackend::from_str(spec.kind.backend_name())
        .map_err(|_| format!("Invalid backend '{}'", spec.kind))?;

    let mut builder = LLMBuilder::new()
        .backend(backend)
        .model(&spec.model.model)
        .temperature(spec.model.temperature);

    if let Some(max_tokens) = spec.model.max_tokens {
        builder = builder.max_tokens(max_tokens);
    }
    if let Some(key) = spec.api_key.filter(|k| !k.is_empty()) {
        builder = builder.api_key(key);
    }
    if let Some(base_url) = spec.base_url {
        builder = builder.base_url(base_url);
    }
    if let Some(system) = spec.system.filter(|s| !s.is_empty()) {
        builder = builder.system(system);
    }

    builder.build().map_err(|e| e.to_string())
}

/// Builds an embedding-capable client.
pub(crate) fn build_embedder(
    kind: ProviderKind,
    api_key: &str,
    model: &str,
) -> Result<Box<dyn LLMProvider>, String> {
    let backend = LLMBackend::from_str(kind.backend_name())
        .map_err(|_| format!("Invalid backend '{}'", kind))?;
    LLMBuilder::new()
        .backend(backend)
        .api_key(api_key)
        .model(model)
        .build()
        .map_err(|e| e.to_string())
}

pub(crate) fn to_tools(functions: &[FunctionSpec]) -> Vec<Tool> {
    functions
        .iter()
        .map(|f| Tool {
            tool_type: "function".to_string(),
            function: FunctionTool {
                name: f.name.clone(),
                description: f.description.clone(),
                parameters: f.parameters.clone(),
            },
        })
        .collect()
}

fn to_tool_call(call: &FunctionCall) -> ToolCall {
    ToolCall {
        id: call.id.clone(),
        call_type: "function".to_string(),
        function: LlmFunctionCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        },
    }
}

pub(crate) fn from_tool_call(call: &ToolCall) -> FunctionCall {
    FunctionCall {
        id: call.id.clone(),
        name: call.function.name.clone(),
        arguments: call.function.arguments.clone(),
    }
}

/// Converts a message history into `llm` chat messages. System turns are
/// passed separately through the builder and are skipped here.
pub(crate) fn to_chat_messages(history: &[ContextMessage]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(history.len());
    for (i, message) in history.iter().enumerate() {
        match message.role {
            Role::System => {}
            Role::User => out.push(ChatMessage::user().content(&message.content).build()),
            Role::Assistant if !message.tool_calls.is_empty() => out.push(
                ChatMessage::assistant()
                    .tool_use(message.tool_calls.iter().map(to_tool_call).collect())
                    .content(&message.content)
                    .build(),
            ),
            Role::Assistant => {
                out.push(ChatMessage::assistant().content(&message.content).build())
            }
            Role::Tool => {
                let name = history[..i]
                    .iter()
                    .rev()
                    .flat_map(|m| m.tool_calls.iter())
                    .find(|c| Some(&c.id) == message.tool_call_id.as_ref())
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                let result = ToolCall {
                    id: message.tool_call_id.clone().unwrap_or_default(),
                    call_type: "function".to_string(),
                    function: LlmFunctionCall {
                        name,
                        arguments: message.content.clone(),
                    },
                };
                out.push(ChatMessage::user().tool_result(vec![result]).build());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::PromptMessage;
    use serde_json::json;

    #[test]
    fn system_turns_are_not_chat_messages() {
        let history = vec![
            ContextMessage::from(&PromptMessage::system("be brief")),
            ContextMessage::from(&PromptMessage::user("hi")),
            ContextMessage::assistant("hello", vec![]),
        ];
        assert_eq!(to_chat_messages(&history).len(), 2);
    }

    #[test]
    fn tools_keep_schema() {
        let tools = to_tools(&[FunctionSpec {
            name: "lookup".into(),
            description: "find things".into(),
            parameters: json!({"type": "object"}),
        }]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_type, "function");
        assert_eq!(tools[0].function.name, "lookup");
    }

    #[test]
    fn tool_calls_convert_both_ways() {
        let call = FunctionCall {
            id: "c1".into(),
            name: "lookup".into(),
            arguments: "{}".into(),
        };
        assert_eq!(from_tool_call(&to_tool_call(&call)), call);
    }
}
