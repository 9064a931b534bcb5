//! In-process event bus.
//!
//! Each subscription gets its own receive loop. Handler invocations run
//! concurrently up to the subscription's limit, but events for the same
//! `(instance, chat)` are handed to the handler in publish order.

use crate::error::{EventError, Result};
use crate::events::{EventHandler, EventSource, SubscribeOptions, Subscription};
use crate::{EventKind, InboundEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Delay between redelivery attempts after a handler error.
const RETRY_DELAY_MS: u64 = 1_000;

/// Broadcast-backed event source for the CLI and tests.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<InboundEvent>,
}

impl MemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to every live subscription. Returns the number of receivers.
    pub fn publish(&self, event: InboundEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait::async_trait]
impl EventSource for MemoryEventBus {
    async fn subscribe(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        if options.concurrency == 0 {
            return Err(EventError::SubscribeFailed {
                kind: kind.to_string(),
                message: "concurrency must be at least 1".into(),
            }
            .into());
        }

        let receiver = self.sender.subscribe();
        let permits = Arc::new(Semaphore::new(options.concurrency));
        let (stop_tx, stop_rx) = oneshot::channel();

        tracing::debug!(
            kind = %kind,
            durable_name = %options.durable_name,
            concurrency = options.concurrency,
            "subscription started"
        );

        let task = tokio::spawn(receive_loop(
            kind,
            receiver,
            handler,
            options.clone(),
            permits.clone(),
            stop_rx,
        ));

        Ok(Box::new(MemorySubscription {
            kind,
            durable_name: options.durable_name,
            concurrency: options.concurrency,
            permits,
            stop_tx: Some(stop_tx),
            task,
        }))
    }
}

async fn receive_loop(
    kind: EventKind,
    mut receiver: broadcast::Receiver<InboundEvent>,
    handler: Arc<dyn EventHandler>,
    options: SubscribeOptions,
    permits: Arc<Semaphore>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    // Last handler task per conversation, so same-chat events stay ordered.
    let mut chains: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = &mut stop_rx => break,
            received = receiver.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(kind = %kind, skipped, "subscription lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if event.kind() != kind {
            continue;
        }

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        chains.retain(|_, task| !task.is_finished());
        let chain_key = format!("{}:{}", event.metadata.instance_id, event.chat_id());
        let previous = chains.remove(&chain_key);
        let handler = handler.clone();
        let max_retries = options.max_retries;

        let task = tokio::spawn(async move {
            let _permit = permit;
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            deliver(handler.as_ref(), event, max_retries).await;
        });
        chains.insert(chain_key, task);
    }
}

async fn deliver(handler: &dyn EventHandler, event: InboundEvent, max_retries: u32) {
    let event_id = event.metadata.event_id.clone();
    let mut attempt = 0;
    loop {
        match handler.handle(event.clone()).await {
            Ok(()) => return,
            Err(error) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(%error, %event_id, attempt, max_retries, "handler failed, redelivering");
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
            Err(error) => {
                tracing::error!(%error, %event_id, "handler failed, giving up");
                return;
            }
        }
    }
}

struct MemorySubscription {
    kind: EventKind,
    durable_name: String,
    concurrency: usize,
    permits: Arc<Semaphore>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

#[async_trait::async_trait]
impl Subscription for MemorySubscription {
    async fn unsubscribe(mut self: Box<Self>) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        (&mut self.task)
            .await
            .map_err(|error| EventError::Handler(error.to_string()))?;

        // Every in-flight handler holds a permit; owning them all means none remain.
        let _all = self
            .permits
            .acquire_many(self.concurrency as u32)
            .await
            .map_err(|_| EventError::Closed)?;

        tracing::debug!(kind = %self.kind, durable_name = %self.durable_name, "subscription stopped");
        Ok(())
    }
}
