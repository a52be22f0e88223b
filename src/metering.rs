//! Scope, credential and metering seams supplied by the host application.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::predictor::ProviderKind;
use crate::query::VectorProvider;

/// A billing/credential boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Scope(pub String);

impl Scope {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Where a provider key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKey {
    /// A key owned by the scope.
    Scoped(String),
    /// A platform-wide default key, valid only for catalogued models.
    PlatformDefault(String),
}

impl ProviderKey {
    pub fn secret(&self) -> &str {
        match self {
            ProviderKey::Scoped(k) | ProviderKey::PlatformDefault(k) => k,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VectorCredentials {
    pub api_key: String,
    /// Index host or base URL when the provider needs one.
    pub host: Option<String>,
}

/// Resolves provider and vector-store credentials for a scope.
pub trait Credentials: Send + Sync {
    fn provider_key(&self, scope: &Scope, provider: ProviderKind) -> Option<ProviderKey>;
    fn vector_store(&self, scope: &Scope, provider: VectorProvider) -> Option<VectorCredentials>;
}

/// Credentials held in memory, identical for every scope.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    pub providers: HashMap<ProviderKind, ProviderKey>,
    pub vector_stores: HashMap<VectorProvider, VectorCredentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: ProviderKind, key: ProviderKey) -> Self {
        self.providers.insert(provider, key);
        self
    }

    pub fn with_vector_store(mut self, provider: VectorProvider, creds: VectorCredentials) -> Self {
        self.vector_stores.insert(provider, creds);
        self
    }
}

impl Credentials for StaticCredentials {
    fn provider_key(&self, _scope: &Scope, provider: ProviderKind) -> Option<ProviderKey> {
        self.providers.get(&provider).cloned()
    }

    fn vector_store(&self, _scope: &Scope, provider: VectorProvider) -> Option<VectorCredentials> {
        self.vector_stores.get(&provider).cloned()
    }
}

/// Budget store the engine reports cost to.
#[async_trait]
pub trait CostMeter: Send + Sync {
    /// External budget check made before each provider call.
    async fn has_budget(&self, _scope: &Scope) -> bool {
        true
    }

    async fn record(&self, scope: &Scope, cost: f64);
}

pub struct NoopMeter;

#[async_trait]
impl CostMeter for NoopMeter {
    async fn record(&self, _scope: &Scope, _cost: f64) {}
}

/// Accumulates cost per scope in memory, with an optional spending cap.
#[derive(Default)]
pub struct MemoryMeter {
    totals: Mutex<HashMap<Scope, f64>>,
    limit: Option<f64>,
}

impl MemoryMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: f64) -> Self {
        Self {
            totals: Mutex::new(HashMap::new()),
            limit: Some(limit),
        }
    }

    pub fn total(&self, scope: &Scope) -> f64 {
        self.totals
            .lock()
            .map(|t| t.get(scope).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CostMeter for MemoryMeter {
    async fn has_budget(&self, scope: &Scope) -> bool {
        match self.limit {
            Some(limit) => self.total(scope) < limit,
            None => true,
        }
    }

    async fn record(&self, scope: &Scope, cost: f64) {
        if let Ok(mut totals) = self.totals.lock() {
            *totals.entry(scope.clone()).or_default() += cost;
        }
    }
}
