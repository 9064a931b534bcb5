//! Pure trigger classification.
//!
//! Precedence, first match wins: reaction, dm, reply, mention, name match.

use crate::storage::{Instance, ReplyRule};
use crate::{EventPayload, InboundEvent, MessageEvent, ReactionEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Dm,
    Mention,
    Reply,
    NameMatch,
    Reaction,
    None,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Dm => "dm",
            TriggerType::Mention => "mention",
            TriggerType::Reply => "reply",
            TriggerType::NameMatch => "name_match",
            TriggerType::Reaction => "reaction",
            TriggerType::None => "none",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one event. Transient, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerDecision {
    pub trigger_type: TriggerType,
    /// Policy rule that admitted the trigger. `None` for reactions and skips.
    pub matched_rule: Option<ReplyRule>,
}

impl TriggerDecision {
    pub const NONE: TriggerDecision = TriggerDecision {
        trigger_type: TriggerType::None,
        matched_rule: None,
    };

    fn rule(trigger_type: TriggerType, rule: ReplyRule) -> Self {
        Self {
            trigger_type,
            matched_rule: Some(rule),
        }
    }

    pub fn is_trigger(&self) -> bool {
        self.trigger_type != TriggerType::None
    }
}

/// Decide whether `event` should invoke the agent on `instance`.
///
/// Typing presence never triggers.
pub fn classify(instance: &Instance, event: &InboundEvent) -> TriggerDecision {
    match &event.payload {
        EventPayload::ReactionAdded(reaction) | EventPayload::ReactionRemoved(reaction) => {
            classify_reaction(instance, reaction)
        }
        EventPayload::Message(message) => classify_message(instance, message),
        EventPayload::Typing(_) => TriggerDecision::NONE,
    }
}

fn classify_reaction(instance: &Instance, reaction: &ReactionEvent) -> TriggerDecision {
    let triggers = match &instance.trigger_reactions {
        None => true,
        Some(emoji) => emoji.iter().any(|candidate| candidate == &reaction.emoji),
    };
    if triggers {
        TriggerDecision {
            trigger_type: TriggerType::Reaction,
            matched_rule: None,
        }
    } else {
        TriggerDecision::NONE
    }
}

fn classify_message(instance: &Instance, message: &MessageEvent) -> TriggerDecision {
    if message.is_direct_message && instance.allows(ReplyRule::Dm) {
        return TriggerDecision::rule(TriggerType::Dm, ReplyRule::Dm);
    }

    if instance.allows(ReplyRule::Reply) && replies_to_bot(instance, message) {
        return TriggerDecision::rule(TriggerType::Reply, ReplyRule::Reply);
    }

    if instance.allows(ReplyRule::Mention) && mentions_bot(instance, message) {
        return TriggerDecision::rule(TriggerType::Mention, ReplyRule::Mention);
    }

    if instance.allows(ReplyRule::NameMatch)
        && instance
            .bot_names
            .iter()
            .any(|name| matches_name(&message.text, name))
    {
        return TriggerDecision::rule(TriggerType::NameMatch, ReplyRule::NameMatch);
    }

    TriggerDecision::NONE
}

fn replies_to_bot(instance: &Instance, message: &MessageEvent) -> bool {
    match (&instance.owner_identifier, &message.quoted_sender_id) {
        (Some(owner), Some(quoted)) => owner == quoted,
        _ => false,
    }
}

fn mentions_bot(instance: &Instance, message: &MessageEvent) -> bool {
    if message.is_mention {
        return true;
    }
    if let Some(owner) = &instance.owner_identifier
        && message.mentioned_ids.iter().any(|id| id == owner)
    {
        return true;
    }
    message
        .text
        .split_whitespace()
        .filter_map(|token| token.strip_prefix('@'))
        .map(|handle| handle.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .any(|handle| {
            instance
                .bot_names
                .iter()
                .any(|name| handle.eq_ignore_ascii_case(name))
        })
}

/// Case-insensitive match of `name` in `text` on word boundaries.
fn matches_name(text: &str, name: &str) -> bool {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return false;
    }
    let text = text.to_lowercase();

    let mut offset = 0;
    while let Some(found) = text[offset..].find(&name) {
        let start = offset + found;
        let end = start + name.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        let is_boundary = |c: Option<char>| c.is_none_or(|c| !c.is_alphanumeric());
        if is_boundary(before) && is_boundary(after) {
            return true;
        }
        offset = start + text[start..].chars().next().map_or(1, char::len_utf8);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelType, EventMetadata};

    fn instance(rules: &[ReplyRule]) -> Instance {
        let mut instance: Instance = serde_json::from_value(serde_json::json!({
            "id": "inst-1",
            "channel_type": "discord",
            "owner_identifier": "bot-user",
            "bot_names": ["bot", "Omni Helper"],
        }))
        .expect("instance should parse");
        instance.reply_filter = rules.to_vec();
        instance
    }

    fn message(text: &str, is_direct_message: bool) -> MessageEvent {
        MessageEvent {
            message_id: "m1".into(),
            chat_id: "c1".into(),
            sender_id: "u1".into(),
            sender_name: Some("Ana".into()),
            text: text.into(),
            is_direct_message,
            mentioned_ids: Vec::new(),
            is_mention: false,
            quoted_sender_id: None,
        }
    }

    fn event(payload: EventPayload) -> InboundEvent {
        InboundEvent {
            metadata: EventMetadata {
                event_id: "e1".into(),
                instance_id: "inst-1".into(),
                channel_type: ChannelType::Discord,
                trace_id: None,
                timestamp: chrono::Utc::now(),
            },
            payload,
        }
    }

    fn reaction(emoji: &str) -> InboundEvent {
        event(EventPayload::ReactionAdded(ReactionEvent {
            message_id: "m1".into(),
            chat_id: "c1".into(),
            sender_id: "u1".into(),
            sender_name: None,
            emoji: emoji.into(),
        }))
    }

    #[test]
    fn direct_message_with_dm_policy() {
        let decision = classify(&instance(&[ReplyRule::Dm]), &event(EventPayload::Message(message("hello", true))));
        assert_eq!(decision.trigger_type, TriggerType::Dm);
        assert_eq!(decision.matched_rule, Some(ReplyRule::Dm));
    }

    #[test]
    fn mention_token_depends_on_policy() {
        let text = "hey @bot are you there";
        let with_mention = classify(
            &instance(&[ReplyRule::Mention]),
            &event(EventPayload::Message(message(text, false))),
        );
        assert_eq!(with_mention.trigger_type, TriggerType::Mention);

        let dm_only = classify(&instance(&[ReplyRule::Dm]), &event(EventPayload::Message(message(text, false))));
        assert_eq!(dm_only, TriggerDecision::NONE);
    }

    #[test]
    fn dm_wins_over_name_match() {
        let decision = classify(
            &instance(&[ReplyRule::All]),
            &event(EventPayload::Message(message("bot, are you there?", true))),
        );
        assert_eq!(decision.trigger_type, TriggerType::Dm);
    }

    #[test]
    fn reply_to_bot_message() {
        let mut quoted = message("thanks", false);
        quoted.quoted_sender_id = Some("bot-user".into());
        let decision = classify(&instance(&[ReplyRule::Reply]), &event(EventPayload::Message(quoted.clone())));
        assert_eq!(decision.trigger_type, TriggerType::Reply);

        quoted.quoted_sender_id = Some("someone-else".into());
        let decision = classify(&instance(&[ReplyRule::Reply]), &event(EventPayload::Message(quoted)));
        assert_eq!(decision.trigger_type, TriggerType::None);
    }

    #[test]
    fn mentioned_ids_and_connector_flag() {
        let mut by_id = message("hi there", false);
        by_id.mentioned_ids = vec!["bot-user".into()];
        let decision = classify(&instance(&[ReplyRule::Mention]), &event(EventPayload::Message(by_id)));
        assert_eq!(decision.trigger_type, TriggerType::Mention);

        let mut flagged = message("hi there", false);
        flagged.is_mention = true;
        let decision = classify(&instance(&[ReplyRule::Mention]), &event(EventPayload::Message(flagged)));
        assert_eq!(decision.trigger_type, TriggerType::Mention);
    }

    #[test]
    fn name_match_respects_word_boundaries() {
        assert!(matches_name("Hey BOT, help", "bot"));
        assert!(matches_name("ask omni helper please", "Omni Helper"));
        assert!(!matches_name("the robot is here", "bot"));
        assert!(!matches_name("anything", "  "));

        let decision = classify(
            &instance(&[ReplyRule::NameMatch]),
            &event(EventPayload::Message(message("what does Bot think", false))),
        );
        assert_eq!(decision.trigger_type, TriggerType::NameMatch);
    }

    #[test]
    fn reaction_sets() {
        let mut any = instance(&[]);
        any.trigger_reactions = None;
        assert_eq!(classify(&any, &reaction("🔥")).trigger_type, TriggerType::Reaction);

        let mut none = instance(&[]);
        none.trigger_reactions = Some(Vec::new());
        assert_eq!(classify(&none, &reaction("🔥")), TriggerDecision::NONE);

        let mut listed = instance(&[]);
        listed.trigger_reactions = Some(vec!["👍".into()]);
        assert_eq!(classify(&listed, &reaction("👍")).trigger_type, TriggerType::Reaction);
        assert_eq!(classify(&listed, &reaction("👎")).trigger_type, TriggerType::None);
    }

    #[test]
    fn empty_policy_never_triggers_messages() {
        let decision = classify(&instance(&[]), &event(EventPayload::Message(message("hello @bot", true))));
        assert_eq!(decision, TriggerDecision::NONE);
    }
}
