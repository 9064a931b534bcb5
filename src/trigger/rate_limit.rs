//! Fixed-window trigger rate limiting, keyed per human per channel per bot account.

use crate::{ChannelType, InstanceId};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub instance_id: InstanceId,
    pub channel_type: ChannelType,
    pub sender_id: String,
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.sender_id, self.channel_type, self.instance_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Time until the current window closes. Zero when allowed.
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    length: Duration,
    count: u32,
}

impl Window {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) >= self.length
    }
}

/// Per-key windows in a sharded map, so unrelated senders never contend on one lock.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<RateLimitKey, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one trigger for `key` at `now`.
    ///
    /// Every call inside a window increments its counter; calls past
    /// `max_triggers` are denied until the window expires.
    pub fn allow(&self, key: &RateLimitKey, now: Instant, max_triggers: u32, window: Duration) -> RateDecision {
        let mut entry = self.windows.entry(key.clone()).or_insert(Window {
            started_at: now,
            length: window,
            count: 0,
        });

        if entry.expired(now) {
            *entry = Window {
                started_at: now,
                length: window,
                count: 0,
            };
        }

        entry.count = entry.count.saturating_add(1);
        if entry.count <= max_triggers {
            return RateDecision {
                allowed: true,
                retry_after_ms: 0,
            };
        }

        let elapsed = now.saturating_duration_since(entry.started_at);
        let remaining = entry.length.saturating_sub(elapsed);
        RateDecision {
            allowed: false,
            retry_after_ms: (remaining.as_millis() as u64).max(1),
        }
    }

    /// Drop every expired window. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.expired(now));
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
