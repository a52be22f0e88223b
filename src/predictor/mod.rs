//! Provider predictors: one call to one model provider.
//!
//! Every provider implements [`Predictor`]. Providers come in two families:
//! message-history providers (structured turns, tool calling) and
//! flat-transcript providers (a single text transcript). The
//! [`PredictorSet`] maps a [`ProviderKind`] to its predictor.

mod chat;
mod context;
pub mod pricing;
mod tool_call;
mod transcript;

pub use chat::ChatPredictor;
pub use context::{ContextMessage, PromptMessage, Role, RunContext};
pub use tool_call::{canonical_text, validate_functions, FunctionCall, FunctionSpec};
pub use transcript::TranscriptPredictor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::abort::AbortSignal;
use crate::core::utils::normalize_identifier;

/// Supported model providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
    Google,
    Groq,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "xai")]
    XAI,
    Ollama,
    Phind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    MessageHistory,
    FlatTranscript,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 8] = [
        ProviderKind::OpenAI,
        ProviderKind::Anthropic,
        ProviderKind::Google,
        ProviderKind::Groq,
        ProviderKind::DeepSeek,
        ProviderKind::XAI,
        ProviderKind::Ollama,
        ProviderKind::Phind,
    ];

    /// Backend name understood by the `llm` crate.
    pub fn backend_name(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Groq => "groq",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::XAI => "xai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Phind => "phind",
        }
    }

    pub fn family(self) -> ProviderFamily {
        match self {
            ProviderKind::Ollama | ProviderKind::Phind => ProviderFamily::FlatTranscript,
            _ => ProviderFamily::MessageHistory,
        }
    }

    pub fn requires_key(self) -> bool {
        !matches!(self, ProviderKind::Ollama | ProviderKind::Phind)
    }

    /// Conventional environment variable holding the provider key.
    pub fn default_key_env(self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAI => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Google => Some("GOOGLE_API_KEY"),
            ProviderKind::Groq => Some("GROQ_API_KEY"),
            ProviderKind::DeepSeek => Some("DEEPSEEK_API_KEY"),
            ProviderKind::XAI => Some("XAI_API_KEY"),
            ProviderKind::Ollama | ProviderKind::Phind => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.backend_name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.backend_name())
    }
}

fn default_temperature() -> f32 {
    0.7
}

/// Model settings of a prompt version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub json_mode: bool,
    #[serde(default)]
    pub functions: Vec<FunctionSpec>,
}

impl ModelConfig {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: None,
            seed: None,
            json_mode: false,
            functions: Vec::new(),
        }
    }
}

/// A pending tool call together with the values supplied to answer it.
#[derive(Clone, Copy)]
pub struct Continuation<'a> {
    pub pending: &'a FunctionCall,
    pub inputs: &'a HashMap<String, String>,
    /// The input keys are snake_cased; look the function name up the same way.
    pub identifier_casing: bool,
}

impl<'a> Continuation<'a> {
    /// The tool result, when the inputs hold a value named like the function.
    pub fn tool_result(&self) -> Option<(&'a FunctionCall, &'a str)> {
        let value = if self.identifier_casing {
            self.inputs.get(&normalize_identifier(&self.pending.name))
        } else {
            self.inputs.get(&self.pending.name)
        };
        value.map(|value| (self.pending, value.as_str()))
    }
}

pub type PartialSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Everything one provider call needs.
pub struct PredictRequest<'a> {
    pub api_key: Option<&'a str>,
    pub model: &'a ModelConfig,
    pub prompts: &'a [PromptMessage],
    pub context: &'a RunContext,
    pub use_previous_context: bool,
    pub continuation: Option<Continuation<'a>>,
    pub on_partial: PartialSink<'a>,
    pub abort: &'a AbortSignal,
}

/// What a provider call produced. Never an `Err`: provider failures are
/// carried in `error`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPrediction {
    pub output: String,
    pub error: Option<String>,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub interrupt: Option<FunctionCall>,
    /// Running context after this call.
    pub context: RunContext,
    pub aborted: bool,
}

impl RawPrediction {
    pub fn text(output: impl Into<String>, context: RunContext) -> Self {
        Self {
            output: output.into(),
            context,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, context: RunContext) -> Self {
        let error = error.into();
        let error = if error.trim().is_empty() {
            "Unknown provider error".to_string()
        } else {
            error
        };
        Self {
            error: Some(error),
            context,
            ..Default::default()
        }
    }

    pub(crate) fn aborted(output: String, context: RunContext) -> Self {
        Self {
            output,
            context,
            aborted: true,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, request: PredictRequest<'_>) -> RawPrediction;
}

/// Predictors keyed by provider.
#[derive(Clone, Default)]
pub struct PredictorSet {
    predictors: HashMap<ProviderKind, Arc<dyn Predictor>>,
}

impl PredictorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `llm`-backed predictors for every provider; `base_urls` overrides
    /// endpoints per provider.
    pub fn with_defaults(base_urls: &HashMap<ProviderKind, String>) -> Self {
        let mut set = Self::new();
        for kind in ProviderKind::ALL {
            let base_url = base_urls.get(&kind).cloned();
            let predictor: Arc<dyn Predictor> = match kind.family() {
                ProviderFamily::MessageHistory => {
                    Arc::new(ChatPredictor::new(kind).with_base_url(base_url))
                }
                ProviderFamily::FlatTranscript => {
                    Arc::new(TranscriptPredictor::new(kind).with_base_url(base_url))
                }
            };
            set.insert(kind, predictor);
        }
        set
    }

    pub fn insert(&mut self, kind: ProviderKind, predictor: Arc<dyn Predictor>) {
        self.predictors.insert(kind, predictor);
    }

    pub fn with(mut self, kind: ProviderKind, predictor: Arc<dyn Predictor>) -> Self {
        self.insert(kind, predictor);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn Predictor>> {
        self.predictors.get(&kind).cloned()
    }
}

/// Awaits `fut` unless `abort` is raised first.
pub(crate) async fn unless_aborted<F: Future>(abort: &AbortSignal, fut: F) -> Option<F::Output> {
    if abort.is_aborted() {
        return None;
    }
    tokio::select! {
        _ = abort.aborted() => None,
        out = fut => Some(out),
    }
}

/// Instruction appended to the system prompt in JSON mode.
pub(crate) const JSON_MODE_INSTRUCTION: &str =
    "Respond with a single valid JSON object and nothing else.";
