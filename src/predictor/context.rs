//! Conversation state carried between prompt steps.

use serde::{Deserialize, Serialize};

use super::tool_call::FunctionCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        }
    }
}

/// One role/content pair of a prompt, before or after variable resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// A turn in a structured message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ContextMessage {
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<FunctionCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call: &FunctionCall, result: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: result.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call.id.clone()),
        }
    }
}

impl From<&PromptMessage> for ContextMessage {
    fn from(p: &PromptMessage) -> Self {
        Self {
            role: p.role,
            content: p.content.clone(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// Provider-specific running context of a run.
///
/// Message-history providers keep structured turns; flat-transcript
/// providers keep a single text transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunContext {
    #[default]
    Empty,
    Messages {
        messages: Vec<ContextMessage>,
    },
    Transcript {
        text: String,
    },
}

impl RunContext {
    pub fn messages(&self) -> &[ContextMessage] {
        match self {
            RunContext::Messages { messages } => messages,
            _ => &[],
        }
    }

    pub fn transcript(&self) -> &str {
        match self {
            RunContext::Transcript { text } => text,
            _ => "",
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RunContext::Empty => true,
            RunContext::Messages { messages } => messages.is_empty(),
            RunContext::Transcript { text } => text.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_serializes_with_kind_tag() {
        let ctx = RunContext::Messages {
            messages: vec![ContextMessage::from(&PromptMessage::user("hi"))],
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["kind"], "messages");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json["messages"][0].get("tool_calls").is_none());

        let back: RunContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn accessors_ignore_other_family() {
        let transcript = RunContext::Transcript { text: "User: hi".into() };
        assert!(transcript.messages().is_empty());
        assert_eq!(transcript.transcript(), "User: hi");
        assert!(RunContext::Empty.is_empty());
    }
}
