//! Provider request/reply types and the client trait every schema implements.

use crate::error::ProviderError;
use crate::storage::AgentType;
use crate::{ChannelType, EventKind, InstanceId};
use std::time::Duration;
use tokio::sync::mpsc;

/// Receives reply deltas while a streaming provider produces them.
pub type DeltaSink = mpsc::Sender<String>;

/// Everything a provider needs to run one trigger.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub trace_id: String,
    /// Id of the event that opened this trigger.
    pub event_id: String,
    pub event_kind: EventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub instance_id: InstanceId,
    pub channel_type: ChannelType,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    /// Rendered input text (coalesced and optionally name-prefixed).
    pub text: String,
    /// Emoji for reaction triggers.
    pub emoji: Option<String>,
    pub session_id: String,
    pub agent_id: Option<String>,
    pub agent_type: AgentType,
    /// Upper bound on the whole call.
    pub timeout: Duration,
}

impl ProviderRequest {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// A finished provider reply. Empty `parts` means there is nothing to send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderReply {
    pub parts: Vec<String>,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
}

impl ProviderReply {
    pub fn from_content(content: Option<String>) -> Self {
        Self {
            parts: content.filter(|text| !text.trim().is_empty()).into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|part| part.trim().is_empty())
    }
}

/// Static trait for provider clients.
pub trait AgentClient: Send + Sync + 'static {
    /// Run the trigger and wait for the full reply.
    fn run(
        &self,
        request: &ProviderRequest,
    ) -> impl std::future::Future<Output = Result<ProviderReply, ProviderError>> + Send;

    /// Run the trigger, forwarding deltas to `sink` as they arrive. The
    /// returned reply carries the complete content.
    fn run_streaming(
        &self,
        request: &ProviderRequest,
        sink: DeltaSink,
    ) -> impl std::future::Future<Output = Result<ProviderReply, ProviderError>> + Send {
        async move {
            let reply = self.run(request).await?;
            for part in &reply.parts {
                let _ = sink.send(part.clone()).await;
            }
            Ok(reply)
        }
    }

    /// Hand the trigger off without waiting for a reply. Returns the run id
    /// the provider will reference when it replies, if known.
    fn send(
        &self,
        request: &ProviderRequest,
    ) -> impl std::future::Future<Output = Result<Option<String>, ProviderError>> + Send;
}
