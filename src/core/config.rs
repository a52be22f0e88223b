//! Engine configuration loaded from `~/.prompt-chain/config.toml`.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::crypto::Sealer;
use super::storage::SealedFileBackend;
use crate::api::{ChainRunner, ConfigError};
use crate::chain::flow::DEFAULT_LOOP_LIMIT;
use crate::chain::PromptLookup;
use crate::continuation::{ContinuationStore, MemoryBackend, DEFAULT_TTL};
use crate::metering::{CostMeter, Credentials, ProviderKey, Scope, VectorCredentials};
use crate::predictor::{PredictorSet, ProviderKind};
use crate::prompt_step::{PromptStepExecutor, DEFAULT_MAX_ATTEMPTS};
use crate::query::{QueryExecutor, VectorProvider};
use crate::snippet::{SnippetExecutor, SnippetLimits, DEFAULT_MEMORY_LIMIT, DEFAULT_TIMEOUT};

#[derive(Deserialize, Debug, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub snippet: SnippetConfig,
    #[serde(default)]
    pub continuation: ContinuationConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub vector_stores: HashMap<String, VectorStoreConfig>,
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct RunnerConfig {
    pub max_prompt_attempts: u32,
    pub loop_limit: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_prompt_attempts: DEFAULT_MAX_ATTEMPTS,
            loop_limit: DEFAULT_LOOP_LIMIT,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct SnippetConfig {
    pub timeout_ms: u64,
    pub memory_limit_bytes: usize,
}

impl Default for SnippetConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct ContinuationConfig {
    pub ttl_secs: u64,
    pub dir: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL.as_secs(),
            dir: None,
            key_path: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProviderConfig {
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub platform_default: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct VectorStoreConfig {
    pub api_key_env: Option<String>,
    pub host: Option<String>,
}

fn vector_provider(name: &str) -> Option<VectorProvider> {
    match name.trim().to_ascii_lowercase().as_str() {
        "pinecone" => Some(VectorProvider::Pinecone),
        "memory" => Some(VectorProvider::Memory),
        _ => None,
    }
}

/// `~/.prompt-chain`
pub fn base_dir() -> Result<PathBuf, ConfigError> {
    let home = env::var("HOME").map_err(|_| ConfigError::NoHome)?;
    Ok(PathBuf::from(home).join(".prompt-chain"))
}

impl EngineConfig {
    /// Loads the default config file. A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&base_dir()?.join("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        if let Some(name) = config
            .providers
            .keys()
            .find(|name| ProviderKind::from_name(name).is_none())
        {
            return Err(ConfigError::UnknownProvider(name.clone()));
        }
        if let Some(name) = config
            .vector_stores
            .keys()
            .find(|name| vector_provider(name).is_none())
        {
            return Err(ConfigError::UnknownProvider(name.clone()));
        }
        Ok(config)
    }

    pub fn snippet_limits(&self) -> SnippetLimits {
        SnippetLimits {
            timeout: Duration::from_millis(self.snippet.timeout_ms),
            memory_limit: self.snippet.memory_limit_bytes,
        }
    }

    /// Default predictors, honouring configured base URLs.
    pub fn predictors(&self) -> PredictorSet {
        let base_urls: HashMap<ProviderKind, String> = self
            .providers
            .iter()
            .filter_map(|(name, p)| Some((ProviderKind::from_name(name)?, p.base_url.clone()?)))
            .collect();
        PredictorSet::with_defaults(&base_urls)
    }

    pub fn credentials(&self) -> EnvCredentials {
        EnvCredentials {
            providers: self
                .providers
                .iter()
                .filter_map(|(name, p)| Some((ProviderKind::from_name(name)?, p.clone())))
                .collect(),
            vector_stores: self
                .vector_stores
                .iter()
                .filter_map(|(name, v)| Some((vector_provider(name)?, v.clone())))
                .collect(),
        }
    }

    /// Expiring in-memory records for external runs, sealed files otherwise.
    ///
    /// `password` unlocks (or protects, on first use) the sealing key.
    pub fn continuation_store(
        &self,
        password: Option<&str>,
    ) -> Result<ContinuationStore, ConfigError> {
        let dir = match &self.continuation.dir {
            Some(dir) => dir.clone(),
            None => base_dir()?.join("continuations"),
        };
        let key_path = match &self.continuation.key_path {
            Some(path) => path.clone(),
            None => base_dir()?.join("keys").join("key.bin"),
        };
        let sealer = Sealer::load_or_generate(&key_path, password).map_err(ConfigError::Store)?;
        let durable =
            SealedFileBackend::new(dir, sealer).map_err(|e| ConfigError::Store(e.to_string()))?;
        Ok(
            ContinuationStore::new(Arc::new(MemoryBackend::new()), Arc::new(durable))
                .with_ttl(Duration::from_secs(self.continuation.ttl_secs)),
        )
    }

    /// Wires a runner from this configuration.
    pub fn runner(
        &self,
        lookup: Arc<dyn PromptLookup>,
        meter: Arc<dyn CostMeter>,
        password: Option<&str>,
    ) -> Result<ChainRunner, ConfigError> {
        let credentials: Arc<dyn Credentials> = Arc::new(self.credentials());
        let prompts = PromptStepExecutor::new(self.predictors(), credentials.clone(), meter.clone())
            .with_max_attempts(self.runner.max_prompt_attempts);
        let queries = QueryExecutor::new(credentials, meter);
        Ok(ChainRunner::new(
            prompts,
            SnippetExecutor::new(self.snippet_limits()),
            queries,
            self.continuation_store(password)?,
            lookup,
        )
        .with_loop_limit(self.runner.loop_limit))
    }
}

/// Credentials read from environment variables named in the config.
///
/// Every scope sees the same keys.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    providers: HashMap<ProviderKind, ProviderConfig>,
    vector_stores: HashMap<VectorProvider, VectorStoreConfig>,
}

fn read_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Credentials for EnvCredentials {
    fn provider_key(&self, _scope: &Scope, provider: ProviderKind) -> Option<ProviderKey> {
        let config = self.providers.get(&provider);
        let var = config
            .and_then(|c| c.api_key_env.as_deref())
            .or_else(|| provider.default_key_env())?;
        let key = read_env(var)?;
        if config.is_some_and(|c| c.platform_default) {
            Some(ProviderKey::PlatformDefault(key))
        } else {
            Some(ProviderKey::Scoped(key))
        }
    }

    fn vector_store(&self, _scope: &Scope, provider: VectorProvider) -> Option<VectorCredentials> {
        let config = self.vector_stores.get(&provider)?;
        let api_key = match &config.api_key_env {
            Some(var) => read_env(var)?,
            None => String::new(),
        };
        Some(VectorCredentials {
            api_key,
            host: config.host.clone(),
        })
    }
}
