//! Trigger decisions: classification, rate limiting, reaction dedup, and the outcome log.

pub mod classifier;
pub mod dedup;
pub mod log;
pub mod rate_limit;

pub use classifier::{TriggerDecision, TriggerType, classify};
pub use dedup::{DedupVerdict, ReactionDedup, ReactionKey};
pub use log::{MemoryTriggerLog, TracingTriggerLog, TriggerLogRecord, TriggerLogSink, TriggerOutcome};
pub use rate_limit::{RateDecision, RateLimitKey, RateLimiter};

/// Why an event was dropped before reaching the rate limiter.
///
/// Skips are not errors. They are logged at debug and never written to the
/// trigger log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InstanceNotFound,
    EventKindNotEnabled,
    OwnMessage,
    /// Whitespace-only message body.
    EmptyText,
    NoProvider,
    ProviderInactive,
    NotTriggered,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::InstanceNotFound => "instance_not_found",
            SkipReason::EventKindNotEnabled => "event_kind_not_enabled",
            SkipReason::OwnMessage => "own_message",
            SkipReason::EmptyText => "empty_text",
            SkipReason::NoProvider => "no_provider",
            SkipReason::ProviderInactive => "provider_inactive",
            SkipReason::NotTriggered => "not_triggered",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
