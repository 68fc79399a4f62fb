//! Per-room subscription lifecycle.
//!
//! `transition` is the single table of allowed moves. `SubscriptionTable` applies
//! it per slot and stamps every opened stream with a generation so results from
//! a replaced or cancelled stream can be told apart from the live one.

use std::collections::HashMap;
use std::time::Duration;

/// Delay between a stream ending and the next subscribe attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Slot key of the standing direct-message subscription.
pub const INBOX_KEY: &str = "inbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Room created, activated, or listed by a newer list version.
    Start,
    /// The relay pool accepted the subscription.
    Opened,
    /// The event stream closed.
    StreamEnded,
    /// The reconnect delay elapsed. Carries whether the room is still tracked at that moment.
    ReconnectDue { still_tracked: bool },
    /// Explicit leave, removal or shutdown.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    OpenStream,
    CloseStream,
    ScheduleReconnect,
}

pub fn transition(state: SubscriptionState, trigger: Trigger) -> (SubscriptionState, Action) {
    use SubscriptionState::*;
    match (state, trigger) {
        // A new start always replaces whatever stream was live
        (_, Trigger::Start) => (Subscribing, Action::OpenStream),
        (Subscribing, Trigger::Opened) => (Active, Action::None),
        (Subscribing | Active, Trigger::StreamEnded) => (Ended, Action::ScheduleReconnect),
        (Ended, Trigger::ReconnectDue { still_tracked: true }) => (Subscribing, Action::OpenStream),
        (Ended, Trigger::ReconnectDue { still_tracked: false }) => (Idle, Action::None),
        (Subscribing | Active, Trigger::Cancel) => (Idle, Action::CloseStream),
        (Idle | Ended, Trigger::Cancel) => (Idle, Action::None),
        (state, _) => (state, Action::None),
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SubscriptionState,
    generation: u64,
}

/// Live subscription slots keyed by room stable key (or [`INBOX_KEY`]).
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    slots: HashMap<String, Slot>,
    next_generation: u64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &str) -> SubscriptionState {
        self.slots
            .get(key)
            .map(|s| s.state)
            .unwrap_or(SubscriptionState::Idle)
    }

    pub fn generation(&self, key: &str) -> Option<u64> {
        self.slots.get(key).map(|s| s.generation)
    }

    /// Whether `generation` belongs to the stream currently open for `key`.
    pub fn is_current(&self, key: &str, generation: u64) -> bool {
        self.slots.get(key).is_some_and(|s| {
            s.generation == generation
                && matches!(
                    s.state,
                    SubscriptionState::Subscribing | SubscriptionState::Active
                )
        })
    }

    /// Keys with an open or pending stream.
    pub fn live_keys(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, s)| s.state != SubscriptionState::Idle)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn apply(&mut self, key: &str, trigger: Trigger) -> Action {
        let current = self.state(key);
        let (next, action) = transition(current, trigger);
        if current != next {
            tracing::debug!(key, from = ?current, to = ?next, ?trigger, "subscription transition");
        }
        if action == Action::OpenStream {
            self.next_generation += 1;
            let generation = self.next_generation;
            self.slots.insert(
                key.to_string(),
                Slot {
                    state: next,
                    generation,
                },
            );
        } else if next == SubscriptionState::Idle {
            self.slots.remove(key);
        } else if let Some(slot) = self.slots.get_mut(key) {
            slot.state = next;
        }
        action
    }

    /// Start (or restart) the subscription for `key`. Returns the generation of the new stream.
    pub fn start(&mut self, key: &str) -> u64 {
        self.apply(key, Trigger::Start);
        self.next_generation
    }

    /// Mark the stream as established. Stale generations are ignored.
    pub fn opened(&mut self, key: &str, generation: u64) -> bool {
        if self.generation(key) != Some(generation) {
            return false;
        }
        self.apply(key, Trigger::Opened);
        self.state(key) == SubscriptionState::Active
    }

    /// The stream for `generation` closed. Returns `true` when a reconnect should be scheduled.
    pub fn ended(&mut self, key: &str, generation: u64) -> bool {
        if !self.is_current(key, generation) {
            return false;
        }
        self.apply(key, Trigger::StreamEnded) == Action::ScheduleReconnect
    }

    /// The reconnect timer for `generation` fired. Returns the new generation to open,
    /// or `None` when the room was removed or a newer stream already replaced this one.
    pub fn reconnect_due(&mut self, key: &str, generation: u64, still_tracked: bool) -> Option<u64> {
        match self.slots.get(key) {
            Some(slot)
                if slot.generation == generation && slot.state == SubscriptionState::Ended => {}
            _ => return None,
        }
        match self.apply(key, Trigger::ReconnectDue { still_tracked }) {
            Action::OpenStream => Some(self.next_generation),
            _ => None,
        }
    }

    /// Cancel `key`. Returns `true` if an open stream needs closing; cancelling
    /// an idle or unknown slot is a no-op.
    pub fn cancel(&mut self, key: &str) -> bool {
        self.apply(key, Trigger::Cancel) == Action::CloseStream
    }

    /// Cancel every slot, returning the keys whose streams need closing.
    pub fn cancel_all(&mut self) -> Vec<String> {
        let keys: Vec<String> = self.slots.keys().cloned().collect();
        keys.into_iter().filter(|k| self.cancel(k)).collect()
    }
}
