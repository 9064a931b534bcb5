//! Agent providers: schema clients, resolution, and bounded dispatch.

pub mod agno;
pub mod resolver;
pub mod traits;
pub mod webhook;

pub use agno::AgnoClient;
pub use resolver::ProviderResolver;
pub use traits::{AgentClient, DeltaSink, ProviderReply, ProviderRequest};
pub use webhook::WebhookClient;

use crate::error::ProviderError;
use crate::storage::{AgentProvider, ProviderMode};

/// Wire protocols this crate can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderSchema {
    Agno,
    Webhook,
}

impl ProviderSchema {
    pub fn parse(schema: &str) -> Option<Self> {
        match schema.trim().to_ascii_lowercase().as_str() {
            "agno" => Some(ProviderSchema::Agno),
            "webhook" => Some(ProviderSchema::Webhook),
            _ => None,
        }
    }
}

/// How a provider is driven, fixed when the provider is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    RoundTrip,
    FireAndForget,
    /// Round-trip that can also forward deltas progressively.
    Streaming,
}

impl Capability {
    pub fn of(provider: &AgentProvider) -> Self {
        match (provider.mode, provider.can_stream_response) {
            (ProviderMode::FireAndForget, _) => Capability::FireAndForget,
            (ProviderMode::RoundTrip, true) => Capability::Streaming,
            (ProviderMode::RoundTrip, false) => Capability::RoundTrip,
        }
    }
}

/// Closed set of provider clients.
#[derive(Debug, Clone)]
pub enum ProviderClient {
    Agno(AgnoClient),
    Webhook(WebhookClient),
}

impl ProviderClient {
    pub fn build(http: reqwest::Client, provider: &AgentProvider) -> Result<Self, ProviderError> {
        match ProviderSchema::parse(&provider.schema) {
            Some(ProviderSchema::Agno) => Ok(ProviderClient::Agno(AgnoClient::new(http, provider))),
            Some(ProviderSchema::Webhook) => Ok(ProviderClient::Webhook(WebhookClient::new(http, provider))),
            None => Err(ProviderError::Unavailable(format!(
                "provider {} has unsupported schema '{}'",
                provider.id, provider.schema
            ))),
        }
    }
}

impl AgentClient for ProviderClient {
    async fn run(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        match self {
            ProviderClient::Agno(client) => client.run(request).await,
            ProviderClient::Webhook(client) => client.run(request).await,
        }
    }

    async fn run_streaming(&self, request: &ProviderRequest, sink: DeltaSink) -> Result<ProviderReply, ProviderError> {
        match self {
            ProviderClient::Agno(client) => client.run_streaming(request, sink).await,
            ProviderClient::Webhook(client) => client.run_streaming(request, sink).await,
        }
    }

    async fn send(&self, request: &ProviderRequest) -> Result<Option<String>, ProviderError> {
        match self {
            ProviderClient::Agno(client) => client.send(request).await,
            ProviderClient::Webhook(client) => client.send(request).await,
        }
    }
}

/// A provider record with its client and capability, built once per resolution.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub record: AgentProvider,
    pub capability: Capability,
    pub client: ProviderClient,
}

impl ResolvedProvider {
    pub fn new(http: reqwest::Client, record: AgentProvider) -> Result<Self, ProviderError> {
        let client = ProviderClient::build(http, &record)?;
        Ok(Self {
            capability: Capability::of(&record),
            record,
            client,
        })
    }
}

/// What a dispatch produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Full reply, not yet delivered.
    Reply(ProviderReply),
    /// Reply already forwarded to the delta sink as it was produced.
    Streamed(ProviderReply),
    /// Handed off; any reply arrives later as a separate outbound send.
    Accepted { run_id: Option<String> },
}

impl Dispatched {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Dispatched::Reply(reply) | Dispatched::Streamed(reply) => reply.run_id.as_deref(),
            Dispatched::Accepted { run_id } => run_id.as_deref(),
        }
    }
}

/// Call the provider according to its capability, bounded by `request.timeout`.
///
/// Streaming is used only when a sink is supplied; otherwise a streaming
/// provider is driven round-trip. Never retries.
pub async fn dispatch(
    provider: &ResolvedProvider,
    request: &ProviderRequest,
    sink: Option<DeltaSink>,
) -> Result<Dispatched, ProviderError> {
    let call = async {
        match (provider.capability, sink) {
            (Capability::FireAndForget, _) => provider
                .client
                .send(request)
                .await
                .map(|run_id| Dispatched::Accepted { run_id }),
            (Capability::Streaming, Some(sink)) => provider
                .client
                .run_streaming(request, sink)
                .await
                .map(Dispatched::Streamed),
            (_, _) => provider.client.run(request).await.map(Dispatched::Reply),
        }
    };

    tokio::time::timeout(request.timeout, call)
        .await
        .map_err(|_| ProviderError::Timeout {
            provider_id: provider.record.id.to_string(),
            timeout_ms: request.timeout_ms(),
        })?
}
