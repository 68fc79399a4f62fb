//! Core of a terminal Nostr chat client: public channels, relay-hosted
//! groups and gift-wrapped direct messages behind one room model.

pub mod causal;
pub mod chat;
pub mod dedup;
pub mod error;
pub mod events;
pub mod file_storage;
pub mod gift_wrap;
pub mod identifier;
pub mod lists;
pub mod message_store;
pub mod relay;
pub mod runtime;
pub mod storage;
pub mod subscription;
pub mod types;
pub mod utils;

pub use causal::ReferenceSelector;
pub use chat::ChatCore;
pub use dedup::{DedupCache, EchoCache};
pub use error::{Error, Result};
pub use events::{Command, CoreEffect, Notification, PublishTarget, RoomSummary, TaskEvent};
pub use file_storage::FileConversationLog;
pub use gift_wrap::{unwrap, wrap_message, UnwrappedMessage, WrappedMessage};
pub use identifier::{parse_identifier, resolve_identifier, Identifier, Resolved};
pub use lists::{ListContent, ListDiff, ListKind, ListReconciler, VersionedList};
pub use message_store::MessageStore;
pub use relay::{DirectPublishReport, PublishReport, RelayPool};
pub use runtime::{ChatHandle, Runtime};
pub use storage::{ConversationLog, InMemoryLog, NullLog};
pub use subscription::{SubscriptionState, SubscriptionTable};
pub use types::*;
