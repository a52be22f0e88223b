//! Multi-step LLM chain execution.
//!
//! A [`Chain`] is an ordered list of prompt, snippet, branch and vector
//! query steps sharing one set of named inputs. [`ChainRunner`] walks the
//! steps, applies branch and loop rules, aggregates cost and tokens, and
//! checkpoints runs that pause on a tool call so they can be resumed.

pub mod abort;
pub mod api;
pub mod chain;
pub mod continuation;
pub mod core;
pub mod metering;
pub mod predictor;
pub mod prompt_step;
pub mod query;
pub mod result;
pub mod snippet;
pub mod template;

pub use abort::AbortSignal;
pub use api::{ChainError, ChainRun, ChainRunner, ConfigError, StoreError};
pub use chain::{Chain, InlinePrompts, PromptLookup, PromptRef, PromptVersion, Step, StepKind};
pub use continuation::ContinuationStore;
pub use self::core::config::EngineConfig;
pub use metering::{CostMeter, Credentials, Scope};
pub use result::{RunResult, StepResult, StepSummary};
