//! Messages crossing the boundary between the single-threaded core, the
//! background tasks and the UI. All plain data.

use crate::gift_wrap::{UnwrappedMessage, WrappedMessage};
use crate::lists::{ListKind, VersionedList};
use crate::relay::{DirectPublishReport, PublishReport};
use crate::types::{
    ChannelMetadata, ChatMessage, GroupKey, GroupMetadataFields, ProfileFields, RoomRef,
};
use nostr::{Event, PublicKey};
use std::time::Duration;

/// Requests from the UI into the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ListRooms,
    /// Focus a room, tracking it first if needed.
    Activate(RoomRef),
    Send {
        room: RoomRef,
        text: String,
    },
    JoinChannel(String),
    JoinGroup {
        group: GroupKey,
        invite_code: Option<String>,
    },
    /// Open a DM with anything `resolve` understands. Optionally sends a first message.
    OpenDirect {
        identifier: String,
        text: Option<String>,
    },
    Leave(RoomRef),
    CreateChannel(ChannelMetadata),
    CreateGroup {
        relay_url: String,
        group_id: Option<String>,
        metadata: GroupMetadataFields,
    },
    EditGroupMetadata {
        group: GroupKey,
        fields: GroupMetadataFields,
    },
    CreateInvite {
        group: GroupKey,
        code: Option<String>,
    },
    PutUser {
        group: GroupKey,
        pubkey: PublicKey,
        role: Option<String>,
    },
    DeleteEvent {
        group: GroupKey,
        event_id: String,
    },
    SetProfile(ProfileFields),
    Resolve(String),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomSummary {
    pub room: RoomRef,
    pub title: String,
    pub unread: usize,
    pub active: bool,
}

/// Results and status from the core to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Rooms(Vec<RoomSummary>),
    Activated {
        room: RoomRef,
        history: Vec<ChatMessage>,
    },
    Message {
        message: ChatMessage,
        active: bool,
        unread: usize,
    },
    RoomAdded(RoomRef),
    RoomRemoved(RoomRef),
    RoomTitle {
        room: RoomRef,
        title: String,
    },
    DisplayName {
        pubkey: PublicKey,
        name: String,
    },
    Resolved {
        input: String,
        pubkey: PublicKey,
    },
    ListApplied {
        list: ListKind,
        version: u64,
        entries: usize,
    },
    /// Transient, informational.
    Status {
        room: Option<RoomRef>,
        text: String,
    },
    /// Rejected input or a publish that reached no relay.
    Error {
        room: Option<RoomRef>,
        text: String,
    },
    ShutdownComplete,
}

/// What a finished resolution should lead to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvePurpose {
    Report,
    OpenDirect { text: Option<String> },
}

/// Where a signed event goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    Configured,
    Relay(String),
}

/// Work the core asks the runtime to perform off-thread.
#[derive(Debug, Clone)]
pub enum CoreEffect {
    Notify(Notification),
    Subscribe {
        key: String,
        generation: u64,
        room: RoomRef,
    },
    SubscribeInbox {
        generation: u64,
        since: u64,
    },
    Unsubscribe {
        key: String,
    },
    ScheduleReconnect {
        key: String,
        generation: u64,
        delay: Duration,
    },
    Publish {
        event: Box<Event>,
        target: PublishTarget,
        label: String,
        room: Option<RoomRef>,
    },
    PublishDirect {
        wrapped: Box<WrappedMessage>,
        recipient: PublicKey,
        room: RoomRef,
    },
    FetchLists,
    FetchProfiles(Vec<PublicKey>),
    Resolve {
        input: String,
        purpose: ResolvePurpose,
    },
    Shutdown,
}

/// Completions reported by background tasks.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    SubscriptionOpened {
        key: String,
        generation: u64,
    },
    RoomEvent {
        key: String,
        generation: u64,
        event: Box<Event>,
    },
    DirectMessage {
        generation: u64,
        message: UnwrappedMessage,
    },
    DirectMessageRejected {
        generation: u64,
        reason: String,
    },
    StreamEnded {
        key: String,
        generation: u64,
        reason: String,
    },
    ReconnectDue {
        key: String,
        generation: u64,
    },
    PublishFinished {
        label: String,
        room: Option<RoomRef>,
        report: PublishReport,
    },
    DirectPublishFinished {
        room: RoomRef,
        result: std::result::Result<DirectPublishReport, String>,
    },
    ListFetched(VersionedList),
    /// The relays hold no copy of this list yet.
    ListMissing(ListKind),
    ListFetchFailed {
        list: ListKind,
        reason: String,
    },
    ProfileFetched {
        pubkey: PublicKey,
        profile: ProfileFields,
    },
    Resolved {
        input: String,
        purpose: ResolvePurpose,
        result: std::result::Result<PublicKey, String>,
    },
}
