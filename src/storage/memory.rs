//! In-process storage backed by fixture records.

use crate::error::{ConfigError, Result};
use crate::storage::{AgentProvider, Instance, Storage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Serializable bundle of instances and providers (CLI fixtures, tests).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub providers: Vec<AgentProvider>,
}

impl Fixtures {
    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|error| ConfigError::Invalid(format!("invalid fixtures: {error}")).into())
    }
}

/// Storage that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    instances: RwLock<HashMap<String, Instance>>,
    providers: RwLock<HashMap<String, AgentProvider>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixtures(fixtures: Fixtures) -> Self {
        let instances = fixtures
            .instances
            .into_iter()
            .map(|instance| (instance.id.to_string(), instance))
            .collect();
        let providers = fixtures
            .providers
            .into_iter()
            .map(|provider| (provider.id.to_string(), provider))
            .collect();
        Self {
            instances: RwLock::new(instances),
            providers: RwLock::new(providers),
        }
    }

    pub async fn upsert_instance(&self, instance: Instance) {
        self.instances
            .write()
            .await
            .insert(instance.id.to_string(), instance);
    }

    pub async fn upsert_provider(&self, provider: AgentProvider) {
        self.providers
            .write()
            .await
            .insert(provider.id.to_string(), provider);
    }

    pub async fn remove_instance(&self, id: &str) -> Option<Instance> {
        self.instances.write().await.remove(id)
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn get_provider(&self, id: &str) -> Result<Option<AgentProvider>> {
        Ok(self.providers.read().await.get(id).cloned())
    }
}
