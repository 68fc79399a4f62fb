//! Event-id deduplication and local-echo suppression.
//!
//! Both caches are owned by the coordinating core and take the current time as
//! an argument, so eviction is deterministic under test.

use std::collections::HashMap;

/// Seen event ids expire after this many seconds.
pub const DEDUP_TTL_SECS: u64 = 30 * 60;
/// A full sweep of the dedup cache runs at most this often.
pub const DEDUP_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
/// Pending local echoes expire after this many seconds.
pub const ECHO_TTL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct DedupCache {
    seen: HashMap<String, u64>,
    ttl: u64,
    sweep_interval: u64,
    last_sweep: u64,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_ttl(DEDUP_TTL_SECS, DEDUP_SWEEP_INTERVAL_SECS)
    }

    pub fn with_ttl(ttl: u64, sweep_interval: u64) -> Self {
        Self {
            seen: HashMap::new(),
            ttl,
            sweep_interval,
            last_sweep: 0,
        }
    }

    /// Record `event_id` as seen at `now`. Returns `false` if it was already present.
    pub fn insert(&mut self, event_id: &str, now: u64) -> bool {
        self.maybe_sweep(now);
        if self.seen.contains_key(event_id) {
            return false;
        }
        self.seen.insert(event_id.to_string(), now);
        true
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains_key(event_id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn maybe_sweep(&mut self, now: u64) {
        if now.saturating_sub(self.last_sweep) < self.sweep_interval {
            return;
        }
        self.last_sweep = now;
        let ttl = self.ttl;
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| now.saturating_sub(*seen_at) < ttl);
        let evicted = before - self.seen.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.seen.len(), "swept dedup cache");
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending echoes of our own direct messages, keyed by `peer:content`.
///
/// Two identical messages to the same peer inside the TTL collapse into one
/// suppression; that is a known limitation of keying on content.
#[derive(Debug, Clone)]
pub struct EchoCache {
    pending: HashMap<String, u64>,
    ttl: u64,
}

impl EchoCache {
    pub fn new() -> Self {
        Self::with_ttl(ECHO_TTL_SECS)
    }

    pub fn with_ttl(ttl: u64) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    fn key(peer_hex: &str, content: &str) -> String {
        format!("{}:{}", peer_hex, content)
    }

    pub fn record(&mut self, peer_hex: &str, content: &str, now: u64) {
        let ttl = self.ttl;
        self.pending
            .retain(|_, sent_at| now.saturating_sub(*sent_at) < ttl);
        self.pending.insert(Self::key(peer_hex, content), now);
    }

    /// Consume a matching pending echo. Returns `true` if the delivery should be suppressed.
    pub fn consume(&mut self, peer_hex: &str, content: &str) -> bool {
        self.pending.remove(&Self::key(peer_hex, content)).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for EchoCache {
    fn default() -> Self {
        Self::new()
    }
}
