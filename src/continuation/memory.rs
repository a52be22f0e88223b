use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::ContinuationBackend;
use crate::api::StoreError;

struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

/// Process-local backend. Entries with a ttl vanish once it elapses.
#[derive(Default)]
pub struct MemoryBackend {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContinuationBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| StoreError::Backend("continuation map poisoned".into()))?;
        let expired = match slots.get(key) {
            None => return Ok(None),
            Some(slot) => slot.expires_at.is_some_and(|at| Instant::now() >= at),
        };
        if expired {
            slots.remove(key);
            return Ok(None);
        }
        Ok(slots.get(key).map(|s| s.value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| StoreError::Backend("continuation map poisoned".into()))?;
        let now = Instant::now();
        // Paused runs that are never resumed are dropped here.
        slots.retain(|_, slot| slot.expires_at.map_or(true, |at| at > now));
        slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_entries_are_gone() {
        let backend = MemoryBackend::new();
        backend
            .put("short", "v".into(), Some(Duration::from_millis(0)))
            .await
            .unwrap();
        backend.put("forever", "w".into(), None).await.unwrap();

        assert_eq!(backend.get("short").await.unwrap(), None);
        assert_eq!(backend.get("forever").await.unwrap().as_deref(), Some("w"));
    }

    #[tokio::test]
    async fn put_purges_expired_entries_never_read_again() {
        let backend = MemoryBackend::new();
        backend
            .put("abandoned", "v".into(), Some(Duration::from_millis(0)))
            .await
            .unwrap();
        backend
            .put("live", "w".into(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        backend.put("kept", "x".into(), None).await.unwrap();

        let slots = backend.slots.lock().unwrap();
        assert!(!slots.contains_key("abandoned"));
        assert!(slots.contains_key("live"));
        assert!(slots.contains_key("kept"));
        assert_eq!(slots.len(), 2);
    }
}
