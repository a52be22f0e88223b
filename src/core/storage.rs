use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::crypto::Sealer;
use super::utils::ensure_dir;
use crate::api::StoreError;
use crate::continuation::ContinuationBackend;

/// What gets sealed into each file.
#[derive(Serialize, Deserialize)]
struct Envelope {
    expires_at: Option<DateTime<Utc>>,
    payload: String,
}

/// Durable backend writing one sealed file per key.
pub struct SealedFileBackend {
    dir: PathBuf,
    sealer: Sealer,
}

impl SealedFileBackend {
    pub fn new(dir: impl Into<PathBuf>, sealer: Sealer) -> Result<Self, StoreError> {
        let dir = dir.into();
        ensure_dir(&dir).map_err(StoreError::Backend)?;
        Ok(Self { dir, sealer })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.sealed", name))
    }
}

#[async_trait]
impl ContinuationBackend for SealedFileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        let sealed = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let plain = self.sealer.open(&sealed).map_err(StoreError::Crypto)?;
        let envelope: Envelope = serde_json::from_slice(&plain)?;

        if envelope.expires_at.is_some_and(|at| Utc::now() >= at) {
            debug!(path = %path.display(), "removing expired continuation file");
            tokio::fs::remove_file(&path).await.ok();
            return Ok(None);
        }
        Ok(Some(envelope.payload))
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| StoreError::Backend(e.to_string()))?,
            ),
            None => None,
        };
        let envelope = Envelope {
            expires_at,
            payload: value,
        };
        let sealed = self
            .sealer
            .seal(&serde_json::to_vec(&envelope)?)
            .map_err(StoreError::Crypto)?;
        tokio::fs::write(self.path_for(key), sealed).await?;
        Ok(())
    }
}
