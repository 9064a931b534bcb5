//! Dispatchbot: decides whether, when, and how an agent replies to inbound channel events.

pub mod config;
pub mod debounce;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod messaging;
pub mod provider;
pub mod storage;
pub mod trigger;

pub use dispatcher::{DispatcherHandle, setup};
pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Instance (connected channel account) identifier type.
pub type InstanceId = Arc<str>;

/// Agent provider identifier type.
pub type ProviderId = Arc<str>;

/// Channel platform an instance is connected to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    Discord,
    WhatsappBaileys,
    WhatsappCloud,
    Slack,
    Telegram,
    Webchat,
    #[serde(other)]
    Unknown,
}

/// Fallback message length for channels without a known limit.
pub const DEFAULT_MESSAGE_LIMIT: usize = 4000;

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Discord => "discord",
            ChannelType::WhatsappBaileys => "whatsapp-baileys",
            ChannelType::WhatsappCloud => "whatsapp-cloud",
            ChannelType::Slack => "slack",
            ChannelType::Telegram => "telegram",
            ChannelType::Webchat => "webchat",
            ChannelType::Unknown => "unknown",
        }
    }

    /// Maximum length of a single outbound message on this channel.
    pub fn message_limit(self) -> usize {
        match self {
            ChannelType::Discord => 2000,
            ChannelType::WhatsappBaileys | ChannelType::WhatsappCloud => 65536,
            ChannelType::Slack => 40000,
            ChannelType::Telegram => 4096,
            ChannelType::Webchat | ChannelType::Unknown => DEFAULT_MESSAGE_LIMIT,
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inbound event kinds the dispatcher subscribes to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "reaction.received")]
    ReactionReceived,
    #[serde(rename = "reaction.removed")]
    ReactionRemoved,
    #[serde(rename = "presence.typing")]
    PresenceTyping,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::MessageReceived,
        EventKind::ReactionReceived,
        EventKind::ReactionRemoved,
        EventKind::PresenceTyping,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::MessageReceived => "message.received",
            EventKind::ReactionReceived => "reaction.received",
            EventKind::ReactionRemoved => "reaction.removed",
            EventKind::PresenceTyping => "presence.typing",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport metadata attached to every inbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: String,
    pub instance_id: InstanceId,
    pub channel_type: ChannelType,
    /// End-to-end trace id, if the connector assigned one.
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A normalized event delivered by the event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub metadata: EventMetadata,
    pub payload: EventPayload,
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::Message(_) => EventKind::MessageReceived,
            EventPayload::ReactionAdded(_) => EventKind::ReactionReceived,
            EventPayload::ReactionRemoved(_) => EventKind::ReactionRemoved,
            EventPayload::Typing(_) => EventKind::PresenceTyping,
        }
    }

    pub fn chat_id(&self) -> &str {
        match &self.payload {
            EventPayload::Message(message) => &message.chat_id,
            EventPayload::ReactionAdded(reaction) | EventPayload::ReactionRemoved(reaction) => {
                &reaction.chat_id
            }
            EventPayload::Typing(typing) => &typing.chat_id,
        }
    }
}

/// Event payload variants, tagged by event kind on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventPayload {
    #[serde(rename = "message.received")]
    Message(MessageEvent),
    #[serde(rename = "reaction.received")]
    ReactionAdded(ReactionEvent),
    #[serde(rename = "reaction.removed")]
    ReactionRemoved(ReactionEvent),
    #[serde(rename = "presence.typing")]
    Typing(TypingEvent),
}

/// Inbound chat message, already normalized by the channel connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub text: String,
    /// True for one-to-one chats.
    #[serde(default)]
    pub is_direct_message: bool,
    /// Platform ids explicitly mentioned in the message.
    #[serde(default)]
    pub mentioned_ids: Vec<String>,
    /// Connector-level mention flag for platforms that resolve mentions themselves.
    #[serde(default)]
    pub is_mention: bool,
    /// Author of the message this one quotes or replies to.
    #[serde(default)]
    pub quoted_sender_id: Option<String>,
}

/// Emoji reaction added to or removed from a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionEvent {
    /// The message the reaction targets.
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub emoji: String,
}

/// Typing presence from a human in a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingEvent {
    pub chat_id: String,
    pub sender_id: String,
}

/// Per-conversation key used by the debouncer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatKey {
    pub instance_id: InstanceId,
    pub chat_id: String,
}

impl ChatKey {
    pub fn new(instance_id: InstanceId, chat_id: impl Into<String>) -> Self {
        Self {
            instance_id,
            chat_id: chat_id.into(),
        }
    }
}

impl std::fmt::Display for ChatKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.chat_id)
    }
}
