//! Checkpoints of paused runs.
//!
//! Externally triggered runs keep their checkpoints in an ephemeral,
//! expiring backend. Other runs use a durable backend and their ids are
//! prefixed with the owning chain version.

mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::StoreError;
use crate::core::utils::random_id;
use crate::predictor::{FunctionCall, RunContext};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

const ID_LEN: usize = 16;

/// Key/value storage for serialized checkpoints.
#[async_trait]
pub trait ContinuationBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value`, expiring after `ttl` when given.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;
}

/// A serialized checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationRecord {
    pub resume_index: Option<usize>,
    pub pending_function_call: Option<FunctionCall>,
    pub request_continuation: bool,
    pub context: RunContext,
    pub inputs: HashMap<String, String>,
    pub owning_version: String,
    pub saved_at: DateTime<Utc>,
}

/// State a run starts from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resumed {
    pub resume_index: Option<usize>,
    pub pending_function_call: Option<FunctionCall>,
    pub request_continuation: bool,
    pub context: RunContext,
    pub inputs: HashMap<String, String>,
    /// Whether a stored record was found for the id.
    pub restored: bool,
}

/// What [`ContinuationStore::save`] persists.
pub struct Checkpoint<'a> {
    pub id: Option<&'a str>,
    pub resume_index: Option<usize>,
    pub pending_function_call: Option<&'a FunctionCall>,
    pub request_continuation: bool,
    pub context: &'a RunContext,
    pub inputs: &'a HashMap<String, String>,
    pub owning_version: &'a str,
    pub externally_triggered: bool,
    /// Whether the run actually paused; nothing is written otherwise.
    pub paused: bool,
}

#[derive(Clone)]
pub struct ContinuationStore {
    ephemeral: Arc<dyn ContinuationBackend>,
    durable: Arc<dyn ContinuationBackend>,
    ttl: Duration,
}

fn record_key(id: &str) -> String {
    format!("continuation:{}", id)
}

fn version_slug(version: &str) -> String {
    let slug: String = version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if slug.is_empty() {
        "unversioned".to_string()
    } else {
        slug
    }
}

impl ContinuationStore {
    pub fn new(
        ephemeral: Arc<dyn ContinuationBackend>,
        durable: Arc<dyn ContinuationBackend>,
    ) -> Self {
        Self {
            ephemeral,
            durable,
            ttl: DEFAULT_TTL,
        }
    }

    /// Both lifetimes kept in process memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(MemoryBackend::new()))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn backend(&self, externally_triggered: bool) -> &dyn ContinuationBackend {
        if externally_triggered {
            self.ephemeral.as_ref()
        } else {
            self.durable.as_ref()
        }
    }

    /// Restores the state for `id`, merging `inputs` over the stored ones.
    ///
    /// No id gives a fresh state. An unknown, expired or unreadable id
    /// restarts from step 0 in continuation mode.
    pub async fn load(
        &self,
        id: Option<&str>,
        inputs: &HashMap<String, String>,
        externally_triggered: bool,
    ) -> Resumed {
        let Some(id) = id else {
            return Resumed {
                inputs: inputs.clone(),
                ..Default::default()
            };
        };

        let stored = match self.backend(externally_triggered).get(&record_key(id)).await {
            Ok(Some(raw)) => serde_json::from_str::<ContinuationRecord>(&raw)
                .map_err(|e| warn!(continuation = id, error = %e, "unreadable continuation record"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(continuation = id, error = %e, "continuation backend read failed");
                None
            }
        };

        match stored {
            Some(record) => {
                debug!(
                    continuation = id,
                    resume_index = ?record.resume_index,
                    "continuation restored"
                );
                let mut merged = record.inputs;
                merged.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));
                Resumed {
                    resume_index: record.resume_index,
                    pending_function_call: record.pending_function_call,
                    request_continuation: record.request_continuation,
                    context: record.context,
                    inputs: merged,
                    restored: true,
                }
            }
            None => {
                info!(
                    continuation = id,
                    "continuation missing or expired; restarting from the first step"
                );
                Resumed {
                    resume_index: Some(0),
                    request_continuation: true,
                    inputs: inputs.clone(),
                    ..Default::default()
                }
            }
        }
    }

    /// Persists a paused run and returns its id. A no-op returning `None`
    /// unless the run paused.
    pub async fn save(&self, checkpoint: Checkpoint<'_>) -> Result<Option<String>, StoreError> {
        if !checkpoint.paused {
            return Ok(None);
        }

        let id = match checkpoint.id {
            Some(id) => id.to_string(),
            None if checkpoint.externally_triggered => random_id(ID_LEN),
            None => format!(
                "{}.{}",
                version_slug(checkpoint.owning_version),
                random_id(ID_LEN)
            ),
        };
        let record = ContinuationRecord {
            resume_index: checkpoint.resume_index,
            pending_function_call: checkpoint.pending_function_call.cloned(),
            request_continuation: checkpoint.request_continuation,
            context: checkpoint.context.clone(),
            inputs: checkpoint.inputs.clone(),
            owning_version: checkpoint.owning_version.to_string(),
            saved_at: Utc::now(),
        };
        let ttl = checkpoint.externally_triggered.then_some(self.ttl);

        self.backend(checkpoint.externally_triggered)
            .put(&record_key(&id), serde_json::to_string(&record)?, ttl)
            .await?;
        info!(continuation = %id, resume_index = ?record.resume_index, "continuation saved");
        Ok(Some(id))
    }
}
