//! MessagingManager: routes outbound traffic to the connector for each channel.

use crate::ChannelType;
use crate::error::{DeliveryError, Result};
use crate::messaging::traits::{Messaging, MessagingDyn};
use std::collections::HashMap;
use std::sync::Arc;

/// Manages all channel connectors, one per channel type.
#[derive(Default)]
pub struct MessagingManager {
    adapters: HashMap<ChannelType, Arc<dyn MessagingDyn>>,
}

impl MessagingManager {
    /// Create a new messaging manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any adapter for the same channel type.
    pub fn register(&mut self, adapter: impl Messaging) {
        let channel = Messaging::channel_type(&adapter);
        tracing::debug!(adapter = Messaging::name(&adapter), %channel, "registered messaging adapter");
        self.adapters.insert(channel, Arc::new(adapter));
    }

    /// Register an already shared adapter.
    pub fn register_shared(&mut self, adapter: Arc<dyn MessagingDyn>) {
        self.adapters.insert(adapter.channel_type(), adapter);
    }

    /// Look up the adapter for a channel.
    pub fn get(&self, channel: ChannelType) -> Result<Arc<dyn MessagingDyn>> {
        self.adapters.get(&channel).cloned().ok_or_else(|| {
            DeliveryError::ConnectorNotFound {
                channel: channel.to_string(),
            }
            .into()
        })
    }

    /// Shut down every adapter, logging failures.
    pub async fn shutdown(&self) {
        for adapter in self.adapters.values() {
            if let Err(error) = adapter.shutdown().await {
                tracing::warn!(%error, adapter = adapter.name(), "adapter shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for MessagingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingManager")
            .field("channels", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::StdoutAdapter;

    #[test]
    fn lookup_by_channel() {
        let mut manager = MessagingManager::new();
        manager.register(StdoutAdapter::new(ChannelType::Slack));

        let adapter = manager.get(ChannelType::Slack).expect("slack adapter registered");
        assert_eq!(adapter.name(), "stdout:slack");
        assert!(matches!(
            manager.get(ChannelType::Discord),
            Err(crate::Error::Delivery(DeliveryError::ConnectorNotFound { .. }))
        ));
    }
}
