//! Pinecone over its REST API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{Neighbor, VectorIndex};
use crate::metering::VectorCredentials;

const CONTROL_PLANE: &str = "https://api.pinecone.io";
const API_VERSION: &str = "2024-07";

#[derive(Deserialize)]
struct IndexDescription {
    host: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<Match>,
}

#[derive(Deserialize)]
struct Match {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

impl Match {
    /// Snippet text stored in metadata, falling back to the id.
    fn text(&self) -> String {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("text").or_else(|| m.get("content")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.id.clone())
    }
}

pub struct PineconeIndex {
    client: reqwest::Client,
}

impl Default for PineconeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PineconeIndex {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn resolve_host(
        &self,
        credentials: &VectorCredentials,
        index: &str,
    ) -> Result<String, String> {
        if let Some(host) = &credentials.host {
            return Ok(host.clone());
        }
        let description: IndexDescription = self
            .client
            .get(format!("{}/indexes/{}", CONTROL_PLANE, index))
            .header("Api-Key", &credentials.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("Pinecone index lookup failed: {}", e))?
            .json()
            .await
            .map_err(|e| format!("Pinecone index lookup failed: {}", e))?;
        Ok(description.host)
    }
}

fn query_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}/query", host)
    } else {
        format!("https://{}/query", host)
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn query(
        &self,
        credentials: &VectorCredentials,
        index: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<Neighbor>, String> {
        let host = self.resolve_host(credentials, index).await?;
        let body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
        });
        let response: QueryResponse = self
            .client
            .post(query_url(&host))
            .header("Api-Key", &credentials.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("Pinecone query failed: {}", e))?
            .json()
            .await
            .map_err(|e| format!("Pinecone query failed: {}", e))?;

        Ok(response
            .matches
            .iter()
            .map(|m| Neighbor {
                id: m.id.clone(),
                score: m.score,
                text: m.text(),
            })
            .collect())
    }
}
