//! Instance and agent provider records, and the storage seam they are read through.

pub mod memory;

pub use memory::MemoryStorage;

use crate::config::{DebounceConfig, SplitDelayConfig};
use crate::error::Result;
use crate::{ChannelType, EventKind, InstanceId, ProviderId};
use serde::{Deserialize, Serialize};

/// Which kinds of messages an instance lets the agent reply to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplyRule {
    Dm,
    Mention,
    Reply,
    NameMatch,
    All,
}

/// How provider sessions are scoped.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    /// One session per user across all chats.
    PerUser,
    /// All users in a chat share one session.
    PerChat,
    #[default]
    PerUserPerChat,
}

impl SessionStrategy {
    pub fn session_id(self, user_id: &str, chat_id: &str) -> String {
        match self {
            SessionStrategy::PerUser => user_id.to_string(),
            SessionStrategy::PerChat => chat_id.to_string(),
            SessionStrategy::PerUserPerChat => format!("{user_id}:{chat_id}"),
        }
    }
}

/// Target entity type on agent servers that distinguish agents, teams, and workflows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    #[default]
    Agent,
    Team,
    Workflow,
}

impl AgentType {
    pub fn endpoint(self) -> &'static str {
        match self {
            AgentType::Agent => "agents",
            AgentType::Team => "teams",
            AgentType::Workflow => "workflows",
        }
    }
}

fn default_true() -> bool {
    true
}

/// One connected channel account. Owned by storage; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    #[serde(default)]
    pub name: Option<String>,
    pub channel_type: ChannelType,

    /// The bot's own platform identity on this channel.
    #[serde(default)]
    pub owner_identifier: Option<String>,

    /// Names and handles the bot answers to (for mentions and name matching).
    #[serde(default)]
    pub bot_names: Vec<String>,

    /// Event kinds allowed to trigger the agent. Empty means messages only.
    #[serde(default)]
    pub trigger_events: Vec<EventKind>,

    /// Reply filter policy. Empty means the agent never replies to messages.
    #[serde(default)]
    pub reply_filter: Vec<ReplyRule>,

    /// Emoji that trigger the agent. `None` means any emoji, empty means none.
    #[serde(default)]
    pub trigger_reactions: Option<Vec<String>>,

    #[serde(default)]
    pub agent_provider_id: Option<ProviderId>,

    /// Overrides `rate_limit.max_triggers`.
    #[serde(default)]
    pub trigger_rate_limit: Option<u32>,

    /// Overrides `rate_limit.window_ms`.
    #[serde(default)]
    pub trigger_rate_window_ms: Option<u64>,

    #[serde(default)]
    pub debounce: Option<DebounceConfig>,

    #[serde(default)]
    pub split_delay: Option<SplitDelayConfig>,

    #[serde(default)]
    pub session_strategy: SessionStrategy,

    /// Agent, team, or workflow id on the provider side.
    #[serde(default)]
    pub agent_id: Option<String>,

    #[serde(default)]
    pub agent_type: AgentType,

    /// Prefix provider input with `[Sender Name]: `.
    #[serde(default = "default_true")]
    pub prefix_sender_name: bool,

    /// Overrides the provider's own timeout.
    #[serde(default)]
    pub agent_timeout_ms: Option<u64>,
}

impl Instance {
    /// Whether events of `kind` may trigger the agent on this instance.
    pub fn triggers_on(&self, kind: EventKind) -> bool {
        if self.trigger_events.is_empty() {
            return kind == EventKind::MessageReceived;
        }
        self.trigger_events.contains(&kind)
    }

    pub fn allows(&self, rule: ReplyRule) -> bool {
        self.reply_filter.contains(&ReplyRule::All) || self.reply_filter.contains(&rule)
    }
}

/// Wire mode of an agent provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderMode {
    #[default]
    RoundTrip,
    FireAndForget,
}

/// An agent endpoint record. Immutable per dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProvider {
    pub id: ProviderId,
    pub name: String,
    /// Wire protocol tag, e.g. `agno` or `webhook`.
    pub schema: String,
    #[serde(default)]
    pub mode: ProviderMode,
    #[serde(default)]
    pub can_stream_response: bool,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Schema-specific settings (e.g. a default `agent_id`).
    #[serde(default)]
    pub schema_config: serde_json::Value,
}

/// Lookup API over durable instance/provider storage.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>>;

    async fn get_provider(&self, id: &str) -> Result<Option<AgentProvider>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_follow_strategy() {
        assert_eq!(SessionStrategy::PerUser.session_id("u1", "c1"), "u1");
        assert_eq!(SessionStrategy::PerChat.session_id("u1", "c1"), "c1");
        assert_eq!(SessionStrategy::PerUserPerChat.session_id("u1", "c1"), "u1:c1");
    }

    #[test]
    fn instance_defaults_from_minimal_json() {
        let instance: Instance = serde_json::from_value(serde_json::json!({
            "id": "inst-1",
            "channel_type": "telegram",
        }))
        .expect("minimal instance should parse");

        assert!(instance.triggers_on(EventKind::MessageReceived));
        assert!(!instance.triggers_on(EventKind::ReactionReceived));
        assert!(!instance.allows(ReplyRule::Dm));
        assert!(instance.prefix_sender_name);
        assert_eq!(instance.session_strategy, SessionStrategy::PerUserPerChat);
    }

    #[test]
    fn all_rule_allows_everything() {
        let instance: Instance = serde_json::from_value(serde_json::json!({
            "id": "inst-1",
            "channel_type": "discord",
            "reply_filter": ["all"],
            "trigger_events": ["reaction.received"],
        }))
        .expect("instance should parse");

        assert!(instance.allows(ReplyRule::NameMatch));
        assert!(instance.triggers_on(EventKind::ReactionReceived));
        assert!(!instance.triggers_on(EventKind::MessageReceived));
    }
}
