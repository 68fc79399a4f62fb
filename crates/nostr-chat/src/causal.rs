use crate::types::GroupKey;
use crate::utils::{build_tag, short_id};
use crate::Result;
use nostr::Tag;
use rand::Rng;
use std::collections::{HashMap, VecDeque};

/// Recent event ids kept per group.
pub const REFERENCE_RING_SIZE: usize = 50;
/// References attached to each group write.
pub const REFERENCES_PER_WRITE: usize = 3;
/// Referenced ids are shortened to this many hex characters.
pub const REFERENCE_ID_LEN: usize = 8;

pub const PREVIOUS_TAG: &str = "previous";

/// Picks randomized back-references to recently seen events of a group.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSelector {
    recent: HashMap<GroupKey, VecDeque<String>>,
}

impl ReferenceSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `event_id` as seen in `group`. Ids already in the ring are ignored.
    pub fn observe(&mut self, group: &GroupKey, event_id: &str) {
        let ring = self.recent.entry(group.clone()).or_default();
        if ring.iter().any(|id| id == event_id) {
            return;
        }
        if ring.len() == REFERENCE_RING_SIZE {
            ring.pop_front();
        }
        ring.push_back(event_id.to_string());
    }

    pub fn forget(&mut self, group: &GroupKey) {
        self.recent.remove(group);
    }

    pub fn pool_size(&self, group: &GroupKey) -> usize {
        self.recent.get(group).map(|r| r.len()).unwrap_or(0)
    }

    /// Up to [`REFERENCES_PER_WRITE`] distinct short ids from the group's ring.
    pub fn select(&self, group: &GroupKey) -> Vec<String> {
        let Some(ring) = self.recent.get(group) else {
            return Vec::new();
        };
        let mut pool: Vec<&str> = ring.iter().map(|s| s.as_str()).collect();
        let n = pool.len();
        let k = REFERENCES_PER_WRITE.min(n);

        // Partial Fisher-Yates: fill the last k slots with a uniform sample
        let mut rng = rand::thread_rng();
        for i in (n - k..n).rev() {
            let j = rng.gen_range(0..=i);
            pool.swap(i, j);
        }

        pool[n - k..]
            .iter()
            .map(|id| short_id(id, REFERENCE_ID_LEN).to_string())
            .collect()
    }

    /// `previous` tags for a new write to `group`. Empty when nothing has been seen yet.
    pub fn reference_tags(&self, group: &GroupKey) -> Result<Vec<Tag>> {
        self.select(group)
            .iter()
            .map(|short| build_tag(&[PREVIOUS_TAG, short]))
            .collect()
    }
}
