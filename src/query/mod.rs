//! Vector query steps: embed a query, then fetch its nearest neighbours.

mod memory;
mod pinecone;

pub use memory::MemoryIndex;
pub use pinecone::PineconeIndex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::llm_bridge::build_embedder;
use crate::metering::{CostMeter, Credentials, Scope, VectorCredentials};
use crate::predictor::{pricing, ProviderKind};
use crate::result::StepResult;

/// Supported vector stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorProvider {
    Pinecone,
    Memory,
}

/// The model used to embed query text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub provider: ProviderKind,
    pub model: String,
}

/// One hit returned by an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: String,
    pub score: f32,
    pub text: String,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn query(
        &self,
        credentials: &VectorCredentials,
        index: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<Neighbor>, String>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, api_key: &str, model: &EmbeddingModel, text: &str)
        -> Result<Vec<f32>, String>;
}

/// Embeds through the `llm` crate, building a client per call.
pub struct LlmEmbedder;

#[async_trait]
impl Embedder for LlmEmbedder {
    async fn embed(
        &self,
        api_key: &str,
        model: &EmbeddingModel,
        text: &str,
    ) -> Result<Vec<f32>, String> {
        use llm::embedding::EmbeddingProvider;

        let provider = build_embedder(model.provider, api_key, &model.model)?;
        let mut vectors = provider
            .embed(vec![text.to_string()])
            .await
            .map_err(|e| e.to_string())?;
        if vectors.is_empty() {
            return Err("Embedding provider returned no vectors".to_string());
        }
        Ok(vectors.swap_remove(0))
    }
}

pub struct QueryExecutor {
    credentials: Arc<dyn Credentials>,
    meter: Arc<dyn CostMeter>,
    embedder: Arc<dyn Embedder>,
    indexes: HashMap<VectorProvider, Arc<dyn VectorIndex>>,
}

impl QueryExecutor {
    pub fn new(credentials: Arc<dyn Credentials>, meter: Arc<dyn CostMeter>) -> Self {
        let mut indexes: HashMap<VectorProvider, Arc<dyn VectorIndex>> = HashMap::new();
        indexes.insert(VectorProvider::Pinecone, Arc::new(PineconeIndex::new()));
        Self {
            credentials,
            meter,
            embedder: Arc::new(LlmEmbedder),
            indexes,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_index(mut self, provider: VectorProvider, index: Arc<dyn VectorIndex>) -> Self {
        self.indexes.insert(provider, index);
        self
    }

    /// Embeds `query` and returns the `top_k` nearest snippets, newline-joined.
    pub async fn run(
        &self,
        scope: &Scope,
        provider: VectorProvider,
        embedding: &EmbeddingModel,
        index_name: &str,
        query: &str,
        top_k: usize,
    ) -> StepResult {
        let Some(store_credentials) = self.credentials.vector_store(scope, provider) else {
            return StepResult::failure("missing vector store credentials");
        };
        let api_key = match self.credentials.provider_key(scope, embedding.provider) {
            Some(key) => key.secret().to_string(),
            None if !embedding.provider.requires_key() => String::new(),
            None => return StepResult::failure("missing API key"),
        };
        let Some(index) = self.indexes.get(&provider) else {
            return StepResult::failure(format!("Unsupported vector store '{:?}'", provider));
        };

        let vector = match self.embedder.embed(&api_key, embedding, query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed");
                return StepResult::failure(e);
            }
        };
        let tokens = pricing::count_tokens(query);
        let cost = pricing::cost(embedding.provider, &embedding.model, tokens, 0);
        if cost > 0.0 {
            self.meter.record(scope, cost).await;
        }

        match index.query(&store_credentials, index_name, &vector, top_k).await {
            Ok(neighbors) => {
                debug!(index = index_name, hits = neighbors.len(), "vector query finished");
                let output = neighbors
                    .iter()
                    .map(|n| n.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                let structured = serde_json::to_value(&neighbors).unwrap_or(Value::Null);
                StepResult::success(output, Some(structured)).with_usage(cost, tokens, 0)
            }
            Err(e) => {
                warn!(index = index_name, error = %e, "vector query failed");
                StepResult::failure(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::{MemoryMeter, ProviderKey, StaticCredentials};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _: &str, _: &EmbeddingModel, text: &str) -> Result<Vec<f32>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if text.contains("cat") {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            })
        }
    }

    fn embedding() -> EmbeddingModel {
        EmbeddingModel {
            provider: ProviderKind::OpenAI,
            model: "text-embedding-3-small".into(),
        }
    }

    fn executor(
        creds: StaticCredentials,
        embedder: Arc<FixedEmbedder>,
    ) -> (QueryExecutor, Arc<MemoryMeter>) {
        let index = MemoryIndex::new();
        index.insert("pets", "a", "cats purr", vec![0.9, 0.1]);
        index.insert("pets", "b", "dogs bark", vec![0.1, 0.9]);
        let meter = Arc::new(MemoryMeter::new());
        let exec = QueryExecutor::new(Arc::new(creds), meter.clone())
            .with_embedder(embedder)
            .with_index(VectorProvider::Memory, Arc::new(index));
        (exec, meter)
    }

    fn full_credentials() -> StaticCredentials {
        StaticCredentials::new()
            .with_provider(ProviderKind::OpenAI, ProviderKey::Scoped("sk".into()))
            .with_vector_store(VectorProvider::Memory, VectorCredentials::default())
    }

    #[tokio::test]
    async fn returns_nearest_snippets_in_order() {
        let embedder = Arc::new(FixedEmbedder { calls: AtomicUsize::new(0) });
        let (exec, meter) = executor(full_credentials(), embedder);
        let scope = Scope::new("team");
        let result = exec
            .run(&scope, VectorProvider::Memory, &embedding(), "pets", "tell me about cats", 2)
            .await;
        assert!(!result.failed);
        assert_eq!(result.output.as_deref(), Some("cats purr\ndogs bark"));
        let hits = result.structured.unwrap();
        assert_eq!(hits[0]["id"], "a");
        assert!(result.cost > 0.0);
        assert!((meter.total(&scope) - result.cost).abs() < 1e-12);
    }

    #[tokio::test]
    async fn missing_store_credentials_fail_first() {
        let embedder = Arc::new(FixedEmbedder { calls: AtomicUsize::new(0) });
        let creds = StaticCredentials::new()
            .with_provider(ProviderKind::OpenAI, ProviderKey::Scoped("sk".into()));
        let (exec, _) = executor(creds, embedder.clone());
        let result = exec
            .run(&Scope::new("t"), VectorProvider::Memory, &embedding(), "pets", "cats", 1)
            .await;
        assert_eq!(result.error.as_deref(), Some("missing vector store credentials"));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_embedding_key_fails_without_embedding() {
        let embedder = Arc::new(FixedEmbedder { calls: AtomicUsize::new(0) });
        let creds = StaticCredentials::new()
            .with_vector_store(VectorProvider::Memory, VectorCredentials::default());
        let (exec, _) = executor(creds, embedder.clone());
        let result = exec
            .run(&Scope::new("t"), VectorProvider::Memory, &embedding(), "pets", "cats", 1)
            .await;
        assert_eq!(result.error.as_deref(), Some("missing API key"));
        assert_eq!(result.cost, 0.0);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_index_is_a_failure() {
        let embedder = Arc::new(FixedEmbedder { calls: AtomicUsize::new(0) });
        let (exec, _) = executor(full_credentials(), embedder);
        let result = exec
            .run(&Scope::new("t"), VectorProvider::Memory, &embedding(), "nope", "cats", 1)
            .await;
        assert!(result.failed);
        assert_eq!(result.cost, 0.0);
    }
}
