//! Event source seam: how the dispatcher receives inbound events.

pub mod memory;

pub use memory::MemoryEventBus;

use crate::error::Result;
use crate::{EventKind, InboundEvent};
use std::sync::Arc;

/// Receives events for one subscription.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event. Returning an error asks the source to redeliver,
    /// up to the subscription's `max_retries`.
    async fn handle(&self, event: InboundEvent) -> Result<()>;
}

/// Delivery options for a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Stable consumer name so the transport can track offsets across restarts.
    pub durable_name: String,
    /// Maximum concurrent handler invocations.
    pub concurrency: usize,
    /// Redelivery attempts after a handler error.
    pub max_retries: u32,
}

/// A live subscription. Dropping it without `unsubscribe` leaves delivery running.
#[async_trait::async_trait]
pub trait Subscription: Send + Sync {
    /// Stop delivery and wait for in-flight handler invocations to return.
    async fn unsubscribe(self: Box<Self>) -> Result<()>;
}

/// At-least-once source of normalized inbound events.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync + 'static {
    async fn subscribe(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>>;
}
