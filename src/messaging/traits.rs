//! Messaging trait and dynamic dispatch companion.

use crate::error::Result;
use crate::{ChannelType, InstanceId};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Outbound content for a channel connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundContent {
    Text(String),
    /// Begin a progressively rendered reply.
    StreamStart,
    /// Append a delta to the reply in progress.
    StreamChunk(String),
    StreamEnd,
    /// Retract the reply in progress; the run failed before completing.
    StreamAbort,
}

/// A message addressed to one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Platform chat id.
    pub to: String,
    pub content: OutboundContent,
}

impl OutboundMessage {
    pub fn text(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            content: OutboundContent::Text(text.into()),
        }
    }
}

/// Static trait for channel connectors.
/// Use this for type-safe implementations.
pub trait Messaging: Send + Sync + 'static {
    /// Unique name for this adapter.
    fn name(&self) -> &str;

    /// Channel platform this adapter delivers to.
    fn channel_type(&self) -> ChannelType;

    /// Send a message on behalf of an instance.
    fn send_message(
        &self,
        instance_id: &InstanceId,
        message: OutboundMessage,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Show a typing indicator for `duration_ms`. Zero clears it.
    fn send_typing(
        &self,
        _instance_id: &InstanceId,
        _chat_id: &str,
        _duration_ms: u64,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Whether the channel can render a reply progressively from stream chunks.
    fn supports_progressive_rendering(&self) -> bool {
        false
    }

    /// Graceful shutdown.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn MessagingDyn>` for storing different adapters.
pub trait MessagingDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn channel_type(&self) -> ChannelType;

    fn send_message<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        message: OutboundMessage,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn send_typing<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        chat_id: &'a str,
        duration_ms: u64,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn supports_progressive_rendering(&self) -> bool;

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing Messaging automatically implements MessagingDyn.
impl<T: Messaging> MessagingDyn for T {
    fn name(&self) -> &str {
        Messaging::name(self)
    }

    fn channel_type(&self) -> ChannelType {
        Messaging::channel_type(self)
    }

    fn send_message<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        message: OutboundMessage,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::send_message(self, instance_id, message))
    }

    fn send_typing<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        chat_id: &'a str,
        duration_ms: u64,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::send_typing(self, instance_id, chat_id, duration_ms))
    }

    fn supports_progressive_rendering(&self) -> bool {
        Messaging::supports_progressive_rendering(self)
    }

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::shutdown(self))
    }
}
