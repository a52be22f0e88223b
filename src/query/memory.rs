use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{Neighbor, VectorIndex};
use crate::metering::VectorCredentials;

struct Entry {
    id: String,
    text: String,
    vector: Vec<f32>,
}

/// In-process index ranked by cosine similarity.
#[derive(Default)]
pub struct MemoryIndex {
    indexes: RwLock<HashMap<String, Vec<Entry>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: &str, id: &str, text: &str, vector: Vec<f32>) {
        if let Ok(mut indexes) = self.indexes.write() {
            indexes.entry(index.to_string()).or_default().push(Entry {
                id: id.to_string(),
                text: text.to_string(),
                vector,
            });
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn query(
        &self,
        _credentials: &VectorCredentials,
        index: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<Neighbor>, String> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| "Index lock poisoned".to_string())?;
        let entries = indexes
            .get(index)
            .ok_or_else(|| format!("Index '{}' not found", index))?;

        let mut hits: Vec<Neighbor> = entries
            .iter()
            .map(|e| Neighbor {
                id: e.id.clone(),
                score: cosine(&e.vector, vector),
                text: e.text.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ranks_by_similarity_and_truncates() {
        let index = MemoryIndex::new();
        index.insert("docs", "x", "east", vec![1.0, 0.0]);
        index.insert("docs", "y", "north", vec![0.0, 1.0]);
        index.insert("docs", "z", "north-east", vec![0.7, 0.7]);

        let hits = index
            .query(&VectorCredentials::default(), "docs", &[0.0, 1.0], 2)
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["y", "z"]);
    }
}
