//! Bounded, insertion-ordered reaction dedup cache.
//!
//! Entries leave by capacity (oldest first) or by TTL, whichever comes
//! first. A per-message counter caps how many distinct reactions on one
//! target message may trigger while any of them is still tracked.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReactionKey {
    pub message_id: String,
    pub emoji: String,
    pub user_id: String,
}

impl std::fmt::Display for ReactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.message_id, self.emoji, self.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    /// First sighting; the key is now recorded.
    Fresh,
    Duplicate,
    /// The target message already produced its quota of reaction triggers.
    MessageCapReached,
}

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<(ReactionKey, Instant)>,
    entries: HashMap<ReactionKey, Instant>,
    per_message: HashMap<String, u32>,
}

impl Inner {
    fn evict_front(&mut self) {
        let Some((key, inserted_at)) = self.order.pop_front() else {
            return;
        };
        // A re-recorded key leaves a stale queue entry behind; only the live one counts.
        if self.entries.get(&key) != Some(&inserted_at) {
            return;
        }
        self.entries.remove(&key);
        if let Some(count) = self.per_message.get_mut(&key.message_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_message.remove(&key.message_id);
            }
        }
    }

    fn expire(&mut self, now: Instant, ttl: Duration) {
        while let Some((_, inserted_at)) = self.order.front() {
            if now.saturating_duration_since(*inserted_at) < ttl {
                break;
            }
            self.evict_front();
        }
    }
}

#[derive(Debug)]
pub struct ReactionDedup {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl ReactionDedup {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn seen(&self, key: &ReactionKey, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        inner.expire(now, self.ttl);
        inner.entries.contains_key(key)
    }

    /// Insert `key`, evicting the oldest entry first when at capacity.
    pub fn record(&self, key: ReactionKey, now: Instant) {
        let mut inner = self.inner.lock();
        inner.expire(now, self.ttl);
        self.insert(&mut inner, key, now);
    }

    /// `seen` and `record` under one lock, so two rapid redeliveries of the
    /// same reaction cannot both come back fresh.
    pub fn check_and_record(&self, key: ReactionKey, now: Instant, max_per_message: u32) -> DedupVerdict {
        let mut inner = self.inner.lock();
        inner.expire(now, self.ttl);

        if inner.entries.contains_key(&key) {
            return DedupVerdict::Duplicate;
        }
        let triggered = inner.per_message.get(&key.message_id).copied().unwrap_or(0);
        if max_per_message > 0 && triggered >= max_per_message {
            return DedupVerdict::MessageCapReached;
        }

        self.insert(&mut inner, key, now);
        DedupVerdict::Fresh
    }

    fn insert(&self, inner: &mut Inner, key: ReactionKey, now: Instant) {
        if inner.entries.contains_key(&key) {
            inner.entries.insert(key.clone(), now);
            inner.order.push_back((key, now));
            return;
        }
        while inner.entries.len() >= self.capacity {
            inner.evict_front();
        }
        *inner.per_message.entry(key.message_id.clone()).or_insert(0) += 1;
        inner.entries.insert(key.clone(), now);
        inner.order.push_back((key, now));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(message_id: &str, emoji: &str, user_id: &str) -> ReactionKey {
        ReactionKey {
            message_id: message_id.into(),
            emoji: emoji.into(),
            user_id: user_id.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_identical_reaction_is_duplicate() {
        let dedup = ReactionDedup::new(100, Duration::from_secs(600));
        let now = Instant::now();
        assert_eq!(dedup.check_and_record(key("m1", "👍", "u1"), now, 3), DedupVerdict::Fresh);
        assert_eq!(dedup.check_and_record(key("m1", "👍", "u1"), now, 3), DedupVerdict::Duplicate);
        assert_eq!(dedup.check_and_record(key("m1", "👍", "u2"), now, 3), DedupVerdict::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest_first() {
        let dedup = ReactionDedup::new(2, Duration::from_secs(600));
        let now = Instant::now();
        dedup.record(key("m1", "a", "u"), now);
        dedup.record(key("m2", "a", "u"), now);
        dedup.record(key("m3", "a", "u"), now);

        assert_eq!(dedup.len(), 2);
        assert!(!dedup.seen(&key("m1", "a", "u"), now));
        assert!(dedup.seen(&key("m2", "a", "u"), now));
        assert!(dedup.seen(&key("m3", "a", "u"), now));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let dedup = ReactionDedup::new(10, Duration::from_secs(60));
        let now = Instant::now();
        dedup.record(key("m1", "a", "u"), now);
        assert!(dedup.seen(&key("m1", "a", "u"), now + Duration::from_secs(59)));
        assert!(!dedup.seen(&key("m1", "a", "u"), now + Duration::from_secs(60)));
        assert!(dedup.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn per_message_cap_releases_on_eviction() {
        let dedup = ReactionDedup::new(3, Duration::from_secs(600));
        let now = Instant::now();
        for user in ["u1", "u2"] {
            assert_eq!(dedup.check_and_record(key("m1", "🔥", user), now, 2), DedupVerdict::Fresh);
        }
        assert_eq!(
            dedup.check_and_record(key("m1", "🔥", "u3"), now, 2),
            DedupVerdict::MessageCapReached
        );

        // Unrelated reactions push both m1 entries out.
        dedup.record(key("m9", "a", "u"), now);
        dedup.record(key("m8", "a", "u"), now);
        dedup.record(key("m7", "a", "u"), now);
        assert_eq!(dedup.check_and_record(key("m1", "🔥", "u3"), now, 2), DedupVerdict::Fresh);
    }
}
