//! Instance and provider resolution with short-lived caches.

use crate::error::{ProviderError, Result, StorageError};
use crate::provider::ResolvedProvider;
use crate::storage::{Instance, Storage};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

const CACHE_CAPACITY: u64 = 10_000;

pub struct ProviderResolver {
    storage: Arc<dyn Storage>,
    http: reqwest::Client,
    instances: Cache<String, Arc<Instance>>,
    providers: Cache<String, Arc<ResolvedProvider>>,
}

impl ProviderResolver {
    pub fn new(
        storage: Arc<dyn Storage>,
        http: reqwest::Client,
        instance_ttl: Duration,
        provider_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            http,
            instances: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(instance_ttl)
                .build(),
            providers: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(provider_ttl)
                .build(),
        }
    }

    /// Look up an instance. Misses are not cached.
    pub async fn instance(&self, id: &str) -> Result<Option<Arc<Instance>>> {
        if let Some(instance) = self.instances.get(id).await {
            return Ok(Some(instance));
        }
        let Some(instance) = self.storage.get_instance(id).await? else {
            return Ok(None);
        };
        let instance = Arc::new(instance);
        self.instances.insert(id.to_string(), instance.clone()).await;
        Ok(Some(instance))
    }

    /// Fetch a provider record and build its client.
    pub async fn provider(&self, id: &str) -> Result<Arc<ResolvedProvider>> {
        if let Some(provider) = self.providers.get(id).await {
            return Ok(provider);
        }
        let record = self
            .storage
            .get_provider(id)
            .await?
            .ok_or_else(|| StorageError::ProviderNotFound { id: id.to_string() })?;
        let resolved = Arc::new(ResolvedProvider::new(self.http.clone(), record)?);
        tracing::debug!(
            provider_id = %id,
            schema = %resolved.record.schema,
            capability = ?resolved.capability,
            "provider resolved"
        );
        self.providers.insert(id.to_string(), resolved.clone()).await;
        Ok(resolved)
    }

    /// Resolve the provider configured on an instance.
    pub async fn resolve(&self, instance_id: &str) -> Result<Arc<ResolvedProvider>> {
        let instance = self
            .instance(instance_id)
            .await?
            .ok_or_else(|| StorageError::InstanceNotFound { id: instance_id.to_string() })?;
        let provider_id = instance.agent_provider_id.as_deref().ok_or_else(|| {
            ProviderError::Unavailable(format!("instance {instance_id} has no agent provider"))
        })?;
        self.provider(provider_id).await
    }

    /// Drop a cached instance after its configuration changed.
    pub async fn invalidate_instance(&self, id: &str) {
        self.instances.invalidate(id).await;
    }

    /// Drop a cached provider after its configuration changed.
    pub async fn invalidate_provider(&self, id: &str) {
        self.providers.invalidate(id).await;
    }
}
