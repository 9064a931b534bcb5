//! Dispatch orchestration: from inbound events to provider calls and delivered replies.
//!
//! Messages are classified, rate limited, and coalesced per chat before a
//! single provider call. Reactions are classified, rate limited, and deduped,
//! then dispatched without delay. Every attempt that gets past classification
//! writes exactly one trigger log record.

use crate::config::RuntimeConfig;
use crate::debounce::{Debouncer, FlushFn};
use crate::delivery::{PacedSender, chunk_parts};
use crate::error::Result;
use crate::events::{EventHandler, EventSource, SubscribeOptions, Subscription};
use crate::messaging::MessagingManager;
use crate::provider::{self, Dispatched, ProviderRequest, ProviderResolver};
use crate::storage::{Instance, Storage};
use crate::trigger::{
    DedupVerdict, RateLimitKey, RateLimiter, ReactionDedup, ReactionKey, SkipReason, TriggerDecision,
    TriggerLogRecord, TriggerLogSink, TriggerOutcome, TriggerType, classify,
};
use crate::{
    ChannelType, ChatKey, EventKind, EventMetadata, EventPayload, InboundEvent, InstanceId, MessageEvent,
    ReactionEvent,
};
use futures::FutureExt as _;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Buffered deltas between a streaming provider and the connector.
const STREAM_BUFFER: usize = 64;

/// A trigger waiting for dispatch. Several message triggers for one chat
/// coalesce into one before the provider is called.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub instance_id: InstanceId,
    pub channel_type: ChannelType,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub trigger_type: TriggerType,
    pub trace_id: String,
    pub event_kind: EventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Event ids in arrival order.
    pub event_ids: Vec<String>,
    /// Provider input before any sender prefix.
    pub text: String,
    pub emoji: Option<String>,
}

impl Trigger {
    fn from_message(metadata: &EventMetadata, message: &MessageEvent, decision: TriggerDecision) -> Self {
        Self {
            instance_id: metadata.instance_id.clone(),
            channel_type: metadata.channel_type,
            chat_id: message.chat_id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            trigger_type: decision.trigger_type,
            trace_id: trace_id_for(metadata),
            event_kind: EventKind::MessageReceived,
            timestamp: metadata.timestamp,
            event_ids: vec![metadata.event_id.clone()],
            text: message.text.clone(),
            emoji: None,
        }
    }

    fn from_reaction(metadata: &EventMetadata, kind: EventKind, reaction: &ReactionEvent) -> Self {
        Self {
            instance_id: metadata.instance_id.clone(),
            channel_type: metadata.channel_type,
            chat_id: reaction.chat_id.clone(),
            sender_id: reaction.sender_id.clone(),
            sender_name: reaction.sender_name.clone(),
            trigger_type: TriggerType::Reaction,
            trace_id: trace_id_for(metadata),
            event_kind: kind,
            timestamp: metadata.timestamp,
            event_ids: vec![metadata.event_id.clone()],
            text: reaction_text(kind, reaction),
            emoji: Some(reaction.emoji.clone()),
        }
    }

    /// Merge a flushed batch into one trigger. The first message supplies the
    /// sender, trace id, and trigger type; texts join with newlines.
    pub fn coalesce(batch: Vec<Trigger>) -> Option<Trigger> {
        let mut batch = batch.into_iter();
        let mut merged = batch.next()?;
        let mut texts: Vec<String> = Vec::new();
        if !merged.text.trim().is_empty() {
            texts.push(std::mem::take(&mut merged.text));
        }
        for trigger in batch {
            merged.event_ids.extend(trigger.event_ids);
            if !trigger.text.trim().is_empty() {
                texts.push(trigger.text);
            }
        }
        merged.text = texts.join("\n");
        Some(merged)
    }

    fn chat_key(&self) -> ChatKey {
        ChatKey::new(self.instance_id.clone(), self.chat_id.clone())
    }

    fn rate_limit_key(&self) -> RateLimitKey {
        RateLimitKey {
            instance_id: self.instance_id.clone(),
            channel_type: self.channel_type,
            sender_id: self.sender_id.clone(),
        }
    }

    /// Provider input, prefixed with the sender's name when the instance asks for it.
    pub fn render(&self, prefix_sender_name: bool) -> String {
        match &self.sender_name {
            Some(name) if prefix_sender_name && !name.trim().is_empty() => format!("[{name}]: {}", self.text),
            _ => self.text.clone(),
        }
    }

    fn record(&self, outcome: TriggerOutcome, started: Instant) -> TriggerLogRecord {
        TriggerLogRecord {
            instance_id: self.instance_id.clone(),
            chat_id: self.chat_id.clone(),
            trigger_type: self.trigger_type,
            provider_id: None,
            run_id: None,
            latency_ms: started.elapsed().as_millis() as u64,
            outcome,
            trace_id: self.trace_id.clone(),
            event_ids: self.event_ids.clone(),
            error: None,
            created_at: chrono::Utc::now(),
        }
    }
}

fn trace_id_for(metadata: &EventMetadata) -> String {
    metadata
        .trace_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(new_trace_id)
}

pub fn new_trace_id() -> String {
    format!("trc_{}", uuid::Uuid::new_v4().simple())
}

fn reaction_text(kind: EventKind, reaction: &ReactionEvent) -> String {
    if kind == EventKind::ReactionRemoved {
        format!("[Removed reaction {} from message {}]", reaction.emoji, reaction.message_id)
    } else {
        format!("[Reacted with {} to message {}]", reaction.emoji, reaction.message_id)
    }
}

struct Dispatcher {
    resolver: ProviderResolver,
    connectors: MessagingManager,
    config: Arc<RuntimeConfig>,
    trigger_log: Arc<dyn TriggerLogSink>,
    rate_limiter: RateLimiter,
    dedup: ReactionDedup,
    messages: Debouncer<Trigger>,
    reactions: Debouncer<Trigger>,
}

/// Running dispatcher. Call [`DispatcherHandle::cleanup`] to stop it.
pub struct DispatcherHandle {
    dispatcher: Arc<Dispatcher>,
    subscriptions: Vec<(EventKind, Box<dyn Subscription>)>,
    sweep_stop: Option<oneshot::Sender<()>>,
    sweep_task: JoinHandle<()>,
}

/// Subscribe to inbound events and start dispatching.
pub async fn setup(
    events: Arc<dyn EventSource>,
    storage: Arc<dyn Storage>,
    connectors: MessagingManager,
    config: Arc<RuntimeConfig>,
    trigger_log: Arc<dyn TriggerLogSink>,
) -> Result<DispatcherHandle> {
    let snapshot = config.snapshot();
    let resolver = ProviderResolver::new(
        storage,
        reqwest::Client::new(),
        Duration::from_millis(snapshot.dispatcher.instance_cache_ttl_ms),
        Duration::from_millis(snapshot.provider.cache_ttl_ms),
    );

    let dispatcher = Arc::new_cyclic(|weak: &Weak<Dispatcher>| Dispatcher {
        resolver,
        connectors,
        config: config.clone(),
        trigger_log,
        rate_limiter: RateLimiter::new(),
        dedup: ReactionDedup::new(snapshot.dedup.capacity, Duration::from_millis(snapshot.dedup.ttl_ms)),
        messages: Debouncer::new(flush_fn(weak.clone(), FlushKind::Messages)),
        reactions: Debouncer::new(flush_fn(weak.clone(), FlushKind::Reactions)),
    });

    let handler: Arc<dyn EventHandler> = Arc::new(DispatchHandler {
        dispatcher: dispatcher.clone(),
    });
    let mut subscriptions = Vec::with_capacity(EventKind::ALL.len());
    for kind in EventKind::ALL {
        let options = SubscribeOptions {
            durable_name: format!("dispatchbot-{}", kind.as_str().replace('.', "-")),
            concurrency: snapshot.dispatcher.concurrency,
            max_retries: snapshot.dispatcher.max_retries,
        };
        match events.subscribe(kind, handler.clone(), options).await {
            Ok(subscription) => subscriptions.push((kind, subscription)),
            Err(error) => {
                // Roll back what already subscribed so a failed setup leaves nothing running.
                for (_, subscription) in subscriptions {
                    let _ = subscription.unsubscribe().await;
                }
                return Err(error);
            }
        }
    }

    let (sweep_stop, stop_rx) = oneshot::channel();
    let sweep_task = tokio::spawn(sweep_loop(
        dispatcher.clone(),
        Duration::from_millis(snapshot.rate_limit.sweep_interval_ms.max(1)),
        stop_rx,
    ));

    tracing::info!(subscriptions = subscriptions.len(), "dispatcher started");

    Ok(DispatcherHandle {
        dispatcher,
        subscriptions,
        sweep_stop: Some(sweep_stop),
        sweep_task,
    })
}

impl DispatcherHandle {
    /// Stop receiving events, flush every pending buffer, and wait up to the
    /// shutdown grace for the resulting dispatches. Nothing buffered is dropped.
    pub async fn cleanup(mut self) -> Result<()> {
        for (kind, subscription) in self.subscriptions.drain(..) {
            if let Err(error) = subscription.unsubscribe().await {
                tracing::warn!(%error, kind = %kind, "failed to unsubscribe");
            }
        }

        if let Some(stop) = self.sweep_stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.sweep_task).await;

        let grace = Duration::from_millis(self.dispatcher.config.snapshot().dispatcher.shutdown_grace_ms);
        tokio::join!(
            self.dispatcher.messages.shutdown(grace),
            self.dispatcher.reactions.shutdown(grace),
        );

        self.dispatcher.connectors.shutdown().await;
        tracing::info!("dispatcher stopped");
        Ok(())
    }

    /// Forget a cached instance after its configuration changed.
    pub async fn invalidate_instance(&self, id: &str) {
        self.dispatcher.resolver.invalidate_instance(id).await;
    }

    /// Forget a cached provider after its configuration changed.
    pub async fn invalidate_provider(&self, id: &str) {
        self.dispatcher.resolver.invalidate_provider(id).await;
    }

    /// Chats with buffered or in-flight message work.
    pub fn pending_chats(&self) -> usize {
        self.dispatcher.messages.active_keys()
    }
}

#[derive(Clone, Copy)]
enum FlushKind {
    Messages,
    Reactions,
}

fn flush_fn(dispatcher: Weak<Dispatcher>, kind: FlushKind) -> FlushFn<Trigger> {
    Arc::new(move |_key: ChatKey, batch: Vec<Trigger>| {
        let dispatcher = dispatcher.clone();
        async move {
            let Some(dispatcher) = dispatcher.upgrade() else {
                tracing::warn!(triggers = batch.len(), "dispatcher dropped, discarding flushed triggers");
                return;
            };
            match kind {
                FlushKind::Messages => {
                    if let Some(trigger) = Trigger::coalesce(batch) {
                        dispatcher.run_trigger(trigger).await;
                    }
                }
                FlushKind::Reactions => {
                    for trigger in batch {
                        dispatcher.run_trigger(trigger).await;
                    }
                }
            }
        }
        .boxed()
    })
}

async fn sweep_loop(dispatcher: Arc<Dispatcher>, every: Duration, mut stop_rx: oneshot::Receiver<()>) {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = interval.tick() => {
                let removed = dispatcher.rate_limiter.sweep(Instant::now());
                if removed > 0 {
                    tracing::debug!(removed, remaining = dispatcher.rate_limiter.len(), "swept rate limit windows");
                }
            }
        }
    }
}

struct DispatchHandler {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait::async_trait]
impl EventHandler for DispatchHandler {
    async fn handle(&self, event: InboundEvent) -> Result<()> {
        self.dispatcher.handle_event(event).await
    }
}

impl Dispatcher {
    async fn handle_event(&self, event: InboundEvent) -> Result<()> {
        let metadata = &event.metadata;

        if let EventPayload::Typing(typing) = &event.payload {
            let key = ChatKey::new(metadata.instance_id.clone(), typing.chat_id.clone());
            if self.messages.typing(&key) {
                tracing::trace!(chat_key = %key, "typing presence extends debounce");
            }
            return Ok(());
        }

        let Some(instance) = self.resolver.instance(&metadata.instance_id).await? else {
            skip(&event, SkipReason::InstanceNotFound);
            return Ok(());
        };

        let decision = match self.admit(&instance, &event).await {
            Ok(decision) => decision,
            Err(reason) => {
                skip(&event, reason);
                return Ok(());
            }
        };

        match &event.payload {
            EventPayload::Message(message) => {
                let trigger = Trigger::from_message(metadata, message, decision);
                if !self.within_rate_limit(&instance, &trigger) {
                    return Ok(());
                }
                let config = instance.debounce.unwrap_or(self.config.snapshot().debounce);
                tracing::debug!(
                    instance_id = %trigger.instance_id,
                    chat_id = %trigger.chat_id,
                    trigger_type = %trigger.trigger_type,
                    trace_id = %trigger.trace_id,
                    "message buffered"
                );
                self.messages.push(trigger.chat_key(), trigger, config);
            }
            EventPayload::ReactionAdded(reaction) | EventPayload::ReactionRemoved(reaction) => {
                let trigger = Trigger::from_reaction(metadata, event.kind(), reaction);
                if !self.within_rate_limit(&instance, &trigger) || !self.first_reaction(reaction, &trigger) {
                    return Ok(());
                }
                let mut immediate = self.config.snapshot().debounce;
                immediate.mode = crate::config::DebounceMode::Disabled;
                self.reactions.push(trigger.chat_key(), trigger, immediate);
            }
            EventPayload::Typing(_) => {}
        }
        Ok(())
    }

    /// Everything that drops an event silently, ending with classification.
    async fn admit(&self, instance: &Instance, event: &InboundEvent) -> std::result::Result<TriggerDecision, SkipReason> {
        if !instance.triggers_on(event.kind()) {
            return Err(SkipReason::EventKindNotEnabled);
        }

        let sender_id = match &event.payload {
            EventPayload::Message(message) => Some(message.sender_id.as_str()),
            EventPayload::ReactionAdded(reaction) | EventPayload::ReactionRemoved(reaction) => {
                Some(reaction.sender_id.as_str())
            }
            EventPayload::Typing(_) => None,
        };
        if sender_id.is_some() && sender_id == instance.owner_identifier.as_deref() {
            return Err(SkipReason::OwnMessage);
        }
        if let EventPayload::Message(message) = &event.payload
            && message.text.trim().is_empty()
        {
            return Err(SkipReason::EmptyText);
        }

        let Some(provider_id) = instance.agent_provider_id.as_deref() else {
            return Err(SkipReason::NoProvider);
        };
        // Resolution errors surface at dispatch time, where they are logged as outcomes.
        if let Ok(provider) = self.resolver.provider(provider_id).await
            && !provider.record.is_active
        {
            return Err(SkipReason::ProviderInactive);
        }

        let decision = classify(instance, event);
        if !decision.is_trigger() {
            return Err(SkipReason::NotTriggered);
        }
        Ok(decision)
    }

    fn within_rate_limit(&self, instance: &Instance, trigger: &Trigger) -> bool {
        let config = self.config.snapshot().rate_limit;
        let max_triggers = instance.trigger_rate_limit.unwrap_or(config.max_triggers);
        let window = instance
            .trigger_rate_window_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.window());

        let started = Instant::now();
        let decision = self
            .rate_limiter
            .allow(&trigger.rate_limit_key(), started, max_triggers, window);
        if decision.allowed {
            return true;
        }

        tracing::info!(
            instance_id = %trigger.instance_id,
            chat_id = %trigger.chat_id,
            sender_id = %trigger.sender_id,
            trigger_type = %trigger.trigger_type,
            retry_after_ms = decision.retry_after_ms,
            trace_id = %trigger.trace_id,
            "trigger rate limited"
        );
        self.trigger_log.write(trigger.record(TriggerOutcome::RateLimited, started));
        false
    }

    fn first_reaction(&self, reaction: &ReactionEvent, trigger: &Trigger) -> bool {
        let max_per_message = self.config.snapshot().dedup.max_per_message;
        let key = ReactionKey {
            message_id: reaction.message_id.clone(),
            emoji: reaction.emoji.clone(),
            user_id: reaction.sender_id.clone(),
        };
        let started = Instant::now();
        let verdict = self.dedup.check_and_record(key, started, max_per_message);
        if verdict == DedupVerdict::Fresh {
            return true;
        }

        tracing::debug!(
            instance_id = %trigger.instance_id,
            message_id = %reaction.message_id,
            emoji = %reaction.emoji,
            verdict = ?verdict,
            trace_id = %trigger.trace_id,
            "reaction deduplicated"
        );
        self.trigger_log.write(trigger.record(TriggerOutcome::Deduped, started));
        false
    }

    /// Resolve the provider, call it, deliver the reply, and log the outcome.
    #[tracing::instrument(
        skip(self, trigger),
        fields(
            instance_id = %trigger.instance_id,
            chat_id = %trigger.chat_id,
            trigger_type = %trigger.trigger_type,
            trace_id = %trigger.trace_id,
        )
    )]
    async fn run_trigger(&self, trigger: Trigger) {
        let started = Instant::now();
        let mut record = trigger.record(TriggerOutcome::Error, started);
        match self.call_and_deliver(&trigger, &mut record).await {
            Ok(()) => record.outcome = TriggerOutcome::Success,
            Err(error) => {
                tracing::error!(
                    %error,
                    provider_id = record.provider_id.as_deref().unwrap_or("-"),
                    "agent dispatch failed"
                );
                record.error = Some(error.to_string());
            }
        }
        record.latency_ms = started.elapsed().as_millis() as u64;
        record.created_at = chrono::Utc::now();
        self.trigger_log.write(record);
    }

    /// Returns an error only when the provider did not reply. Delivery
    /// failures are recorded on `record` and logged separately.
    async fn call_and_deliver(&self, trigger: &Trigger, record: &mut TriggerLogRecord) -> Result<()> {
        let instance = self.resolver.instance(&trigger.instance_id).await?.ok_or_else(|| {
            crate::error::StorageError::InstanceNotFound {
                id: trigger.instance_id.to_string(),
            }
        })?;
        let provider = self.resolver.resolve(&trigger.instance_id).await?;
        record.provider_id = Some(provider.record.id.clone());
        let connector = self.connectors.get(trigger.channel_type)?;

        let config = self.config.snapshot();
        let timeout = instance
            .agent_timeout_ms
            .or(provider.record.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.provider.timeout());
        let request = ProviderRequest {
            trace_id: trigger.trace_id.clone(),
            event_id: trigger.event_ids.first().cloned().unwrap_or_default(),
            event_kind: trigger.event_kind,
            timestamp: trigger.timestamp,
            instance_id: trigger.instance_id.clone(),
            channel_type: trigger.channel_type,
            chat_id: trigger.chat_id.clone(),
            sender_id: trigger.sender_id.clone(),
            sender_name: trigger.sender_name.clone(),
            text: trigger.render(instance.prefix_sender_name),
            emoji: trigger.emoji.clone(),
            session_id: instance
                .session_strategy
                .session_id(&trigger.sender_id, &trigger.chat_id),
            agent_id: instance.agent_id.clone(),
            agent_type: instance.agent_type,
            timeout,
        };

        let sender = PacedSender {
            connector: connector.as_ref(),
            instance_id: &trigger.instance_id,
            chat_id: &trigger.chat_id,
            split_delay: instance.split_delay.unwrap_or(config.split_delay),
            typing_duration_ms: config.dispatcher.typing_duration_ms,
        };

        tracing::info!(
            provider_id = %provider.record.id,
            capability = ?provider.capability,
            events = trigger.event_ids.len(),
            "dispatching to agent"
        );
        sender.typing(config.dispatcher.typing_duration_ms).await;

        let streaming = provider.capability == provider::Capability::Streaming
            && connector.supports_progressive_rendering();
        let (dispatched, delivered) = if streaming {
            let (sink, deltas) = mpsc::channel(STREAM_BUFFER);
            let (completed_tx, completed_rx) = oneshot::channel();
            let run = async {
                let dispatched = provider::dispatch(&provider, &request, Some(sink)).await;
                let _ = completed_tx.send(dispatched.is_ok());
                dispatched
            };
            let (dispatched, delivered) = tokio::join!(run, sender.stream(deltas, completed_rx));
            (dispatched, Some(delivered.map(|_| ())))
        } else {
            (provider::dispatch(&provider, &request, None).await, None)
        };

        let result = match dispatched {
            Ok(dispatched) => {
                record.run_id = dispatched.run_id().map(str::to_string);
                let delivered = match (dispatched, delivered) {
                    (Dispatched::Reply(reply), _) => {
                        let chunks = chunk_parts(&reply.parts, trigger.channel_type.message_limit());
                        if chunks.is_empty() {
                            tracing::debug!("agent returned no content, nothing to send");
                        }
                        sender.send_all(chunks).await.map(|_| ())
                    }
                    (Dispatched::Streamed(_), Some(delivered)) => delivered,
                    (Dispatched::Streamed(_), None) | (Dispatched::Accepted { .. }, _) => Ok(()),
                };
                if let Err(error) = delivered {
                    tracing::error!(
                        %error,
                        provider_id = %provider.record.id,
                        run_id = record.run_id.as_deref().unwrap_or("-"),
                        "agent replied but delivery failed"
                    );
                    record.error = Some(format!("delivery failed: {error}"));
                }
                Ok(())
            }
            Err(error) => Err(error.into()),
        };

        sender.typing(0).await;
        result
    }
}

fn skip(event: &InboundEvent, reason: SkipReason) {
    tracing::debug!(
        instance_id = %event.metadata.instance_id,
        event_id = %event.metadata.event_id,
        kind = %event.kind(),
        reason = %reason,
        "event skipped"
    );
}
