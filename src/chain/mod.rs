//! Chain definitions: the ordered steps a run walks through.

pub mod flow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::api::ChainError;
use crate::predictor::{ModelConfig, PromptMessage};
use crate::query::{EmbeddingModel, VectorProvider};

pub const DEFAULT_BRANCH: &str = "default";

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_top_k() -> usize {
    5
}

/// A chain: steps plus default input values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

impl Chain {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            vars: HashMap::new(),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, ChainError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ChainError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads a chain file, choosing the format by extension.
    pub fn from_path(path: &Path) -> Result<Self, ChainError> {
        let text = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            other => Err(ChainError::Invalid(format!(
                "unsupported chain file extension {:?}",
                other.unwrap_or("")
            ))),
        }
    }
}

/// One step and the branch it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            branch: default_branch(),
            kind,
        }
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn prompt(id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(StepKind::Prompt(PromptStep {
            prompt: PromptRef {
                id: id.into(),
                version: None,
            },
            output: output.into(),
            include_context: false,
        }))
    }

    pub fn snippet(code: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(StepKind::Snippet {
            code: code.into(),
            output: output.into(),
        })
    }

    pub fn branch(code: impl Into<String>, branches: &[&str]) -> Self {
        Self::new(StepKind::Branch {
            code: code.into(),
            branches: branches.iter().map(|b| b.to_string()).collect(),
        })
    }

    /// Name of the input this step writes, if any.
    pub fn output(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Prompt(p) => Some(&p.output),
            StepKind::Snippet { output, .. } => Some(output),
            StepKind::Branch { .. } => None,
            StepKind::Query { output, .. } => output.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Prompt(PromptStep),
    Snippet {
        code: String,
        output: String,
    },
    /// Runs `code`; the returned label selects the next branch.
    Branch {
        code: String,
        branches: Vec<String>,
    },
    Query {
        query: String,
        vector_provider: VectorProvider,
        index: String,
        embedding: EmbeddingModel,
        #[serde(default = "default_top_k")]
        top_k: usize,
        #[serde(default)]
        output: Option<String>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Prompt(_) => "prompt",
            StepKind::Snippet { .. } => "snippet",
            StepKind::Branch { .. } => "branch",
            StepKind::Query { .. } => "query",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptStep {
    pub prompt: PromptRef,
    pub output: String,
    #[serde(default)]
    pub include_context: bool,
}

/// Versioned prompt reference. No version means the latest one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRef {
    pub id: String,
    #[serde(default)]
    pub version: Option<u32>,
}

/// Messages and model settings of one prompt version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub messages: Vec<PromptMessage>,
    pub model: ModelConfig,
}

/// Fetches prompt versions for prompt steps.
#[async_trait]
pub trait PromptLookup: Send + Sync {
    async fn prompt(&self, reference: &PromptRef) -> Result<PromptVersion, String>;
}

/// Prompt versions held in memory.
#[derive(Debug, Clone, Default)]
pub struct InlinePrompts {
    prompts: HashMap<String, BTreeMap<u32, PromptVersion>>,
}

impl InlinePrompts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, version: u32, prompt: PromptVersion) -> Self {
        self.insert(id, version, prompt);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, version: u32, prompt: PromptVersion) {
        self.prompts
            .entry(id.into())
            .or_default()
            .insert(version, prompt);
    }
}

#[async_trait]
impl PromptLookup for InlinePrompts {
    async fn prompt(&self, reference: &PromptRef) -> Result<PromptVersion, String> {
        let versions = self
            .prompts
            .get(&reference.id)
            .ok_or_else(|| format!("Prompt '{}' not found", reference.id))?;
        let found = match reference.version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };
        found.cloned().ok_or_else(|| match reference.version {
            Some(v) => format!("Prompt '{}' has no version {}", reference.id, v),
            None => format!("Prompt '{}' has no versions", reference.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::ProviderKind;

    const CHAIN: &str = r#"
vars:
  topic: rust
steps:
  - type: prompt
    prompt: { id: greet, version: 2 }
    output: greeting
  - type: branch
    code: "return 'b'"
    branches: [a, b]
  - type: snippet
    branch: a
    code: "return 1"
    output: one
  - type: query
    branch: b
    query: "{{topic}}"
    vector_provider: pinecone
    index: docs
    embedding: { provider: openai, model: text-embedding-3-small }
"#;

    #[test]
    fn parses_yaml_chain_with_defaults() {
        let chain = Chain::from_yaml(CHAIN).unwrap();
        assert_eq!(chain.steps.len(), 4);
        assert_eq!(chain.vars["topic"], "rust");
        assert_eq!(chain.steps[0].branch, DEFAULT_BRANCH);
        assert_eq!(chain.steps[0].output(), Some("greeting"));
        assert_eq!(chain.steps[2].branch, "a");
        match &chain.steps[3].kind {
            StepKind::Query { top_k, output, .. } => {
                assert_eq!(*top_k, 5);
                assert!(output.is_none());
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn unknown_step_type_is_rejected() {
        let err = Chain::from_json(r#"{"steps":[{"type":"teleport"}]}"#).unwrap_err();
        assert!(matches!(err, ChainError::Json(_)));
    }

    #[tokio::test]
    async fn inline_prompts_pick_latest_or_exact_version() {
        let version = |text: &str| PromptVersion {
            messages: vec![PromptMessage::user(text)],
            model: ModelConfig::new(ProviderKind::OpenAI, "gpt-4o-mini"),
        };
        let prompts = InlinePrompts::new()
            .with("greet", 1, version("v1"))
            .with("greet", 3, version("v3"));

        let latest = prompts
            .prompt(&PromptRef { id: "greet".into(), version: None })
            .await
            .unwrap();
        assert_eq!(latest.messages[0].content, "v3");
        let first = prompts
            .prompt(&PromptRef { id: "greet".into(), version: Some(1) })
            .await
            .unwrap();
        assert_eq!(first.messages[0].content, "v1");
        assert!(prompts
            .prompt(&PromptRef { id: "greet".into(), version: Some(2) })
            .await
            .is_err());
    }
}
