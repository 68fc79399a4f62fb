//! The coordinating core. Owns every per-room structure and is only ever
//! driven from one thread; background work is requested as [`CoreEffect`]s
//! and comes back as [`TaskEvent`]s.

use crate::causal::ReferenceSelector;
use crate::dedup::{DedupCache, EchoCache};
use crate::events::{
    Command, CoreEffect, Notification, PublishTarget, ResolvePurpose, RoomSummary, TaskEvent,
};
use crate::gift_wrap::{wrap_message, UnwrappedMessage};
use crate::identifier::{parse_identifier, Identifier};
use crate::lists::{build_list_event, ListContent, ListDiff, ListKind, ListReconciler, VersionedList};
use crate::message_store::MessageStore;
use crate::storage::ConversationLog;
use crate::subscription::{SubscriptionTable, INBOX_KEY, RECONNECT_DELAY};
use crate::types::{
    ChannelMetadata, ChatConfig, ChatMessage, GroupKey, GroupMetadataFields, ProfileFields,
    RoomKind, RoomRef, CHANNEL_CREATE_KIND, CHANNEL_MESSAGE_KIND, CHANNEL_METADATA_KIND,
    GROUP_CREATE_INVITE_KIND, GROUP_CREATE_KIND, GROUP_DELETE_EVENT_KIND,
    GROUP_EDIT_METADATA_KIND, GROUP_JOIN_REQUEST_KIND, GROUP_LEAVE_REQUEST_KIND,
    GROUP_MESSAGE_KIND, GROUP_METADATA_KIND, GROUP_PUT_USER_KIND, METADATA_KIND,
};
use crate::utils::{build_tag, is_hex_pubkey, now_seconds, short_id, tag_value};
use crate::{Error, Result};
use nostr::nips::nip19::ToBech32;
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Tag};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct RoomState {
    room: RoomRef,
    title: Option<String>,
    unread: usize,
}

pub struct ChatCore {
    keys: Keys,
    me: PublicKey,
    config: ChatConfig,
    order: Vec<String>,
    rooms: HashMap<String, RoomState>,
    active: Option<String>,
    dedup: DedupCache,
    echoes: EchoCache,
    store: MessageStore,
    selector: ReferenceSelector,
    lists: ListReconciler,
    // Lists not yet fetched this session, with rooms left while waiting
    awaiting_lists: HashMap<ListKind, Vec<RoomRef>>,
    subscriptions: SubscriptionTable,
    names: HashMap<PublicKey, String>,
    log: Arc<dyn ConversationLog>,
    effects: crossbeam_channel::Sender<CoreEffect>,
    started_at: u64,
    shutting_down: bool,
}

impl ChatCore {
    pub fn new(
        keys: Keys,
        config: ChatConfig,
        log: Arc<dyn ConversationLog>,
        effects: crossbeam_channel::Sender<CoreEffect>,
    ) -> Self {
        let me = keys.public_key();
        let store = MessageStore::new(config.max_messages_per_room);
        let mut names = HashMap::new();
        if let Some(name) = profile_display_name(&config.profile) {
            names.insert(me, name);
        }
        Self {
            keys,
            me,
            config,
            order: Vec::new(),
            rooms: HashMap::new(),
            active: None,
            dedup: DedupCache::new(),
            echoes: EchoCache::new(),
            store,
            selector: ReferenceSelector::new(),
            lists: ListReconciler::new(),
            awaiting_lists: HashMap::new(),
            subscriptions: SubscriptionTable::new(),
            names,
            log,
            effects,
            started_at: now_seconds(),
            shutting_down: false,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.me
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Open the inbox and pull relay state. Call once before feeding commands.
    ///
    /// Until each list's fetch settles, local changes to it are held back and
    /// merged into whatever the relays return, so a fresh session never
    /// overwrites a newer list with its own near-empty state.
    pub fn start(&mut self) {
        for list in ListKind::ALL {
            self.awaiting_lists.insert(list, Vec::new());
        }
        let generation = self.subscriptions.start(INBOX_KEY);
        self.emit(CoreEffect::SubscribeInbox {
            generation,
            since: self.started_at,
        });
        self.emit(CoreEffect::FetchLists);
        self.emit(CoreEffect::FetchProfiles(vec![self.me]));
        self.notify_rooms();
    }

    pub fn is_tracked(&self, room: &RoomRef) -> bool {
        self.rooms.contains_key(&room.stable_key())
    }

    pub fn rooms(&self) -> Vec<RoomRef> {
        self.order
            .iter()
            .filter_map(|k| self.rooms.get(k).map(|s| s.room.clone()))
            .collect()
    }

    pub fn active_room(&self) -> Option<RoomRef> {
        self.active
            .as_ref()
            .and_then(|k| self.rooms.get(k))
            .map(|s| s.room.clone())
    }

    pub fn messages(&self, room: &RoomRef) -> &[ChatMessage] {
        self.store.messages(&room.stable_key())
    }

    pub fn unread(&self, room: &RoomRef) -> usize {
        self.rooms
            .get(&room.stable_key())
            .map(|s| s.unread)
            .unwrap_or(0)
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn list_version(&self, list: ListKind) -> Option<u64> {
        self.lists.version(list)
    }

    pub fn display_name(&self, pubkey: &PublicKey) -> String {
        if let Some(name) = self.names.get(pubkey) {
            return name.clone();
        }
        match pubkey.to_bech32() {
            Ok(npub) => format!("{}…", short_id(&npub, 12)),
            Err(_) => short_id(&pubkey.to_hex(), 8).to_string(),
        }
    }

    pub fn room_summaries(&self) -> Vec<RoomSummary> {
        self.order
            .iter()
            .filter_map(|key| self.rooms.get(key).map(|state| (key, state)))
            .map(|(key, state)| RoomSummary {
                room: state.room.clone(),
                title: self.room_title(state),
                unread: state.unread,
                active: self.active.as_deref() == Some(key.as_str()),
            })
            .collect()
    }

    fn room_title(&self, state: &RoomState) -> String {
        if let Some(title) = &state.title {
            return title.clone();
        }
        match &state.room {
            RoomRef::Direct(pk) => self.display_name(pk),
            RoomRef::Group(group) => group.group_id.clone(),
            room => room.to_string(),
        }
    }

    fn emit(&self, effect: CoreEffect) {
        if self.effects.send(effect).is_err() {
            tracing::debug!("effect receiver dropped");
        }
    }

    fn notify(&self, notification: Notification) {
        self.emit(CoreEffect::Notify(notification));
    }

    fn notify_rooms(&self) {
        self.notify(Notification::Rooms(self.room_summaries()));
    }

    fn status(&self, room: Option<RoomRef>, text: impl Into<String>) {
        self.notify(Notification::Status {
            room,
            text: text.into(),
        });
    }

    fn error(&self, room: Option<RoomRef>, text: impl Into<String>) {
        self.notify(Notification::Error {
            room,
            text: text.into(),
        });
    }

    // ---- commands -------------------------------------------------------

    pub fn handle_command(&mut self, command: Command) {
        if self.shutting_down {
            return;
        }
        let result = match command {
            Command::ListRooms => {
                self.notify_rooms();
                Ok(())
            }
            Command::Activate(room) => {
                self.activate(room);
                Ok(())
            }
            Command::Send { room, text } => self.send_text(&room, &text),
            Command::JoinChannel(id) => self.join_channel(&id),
            Command::JoinGroup { group, invite_code } => self.join_group(group, invite_code),
            Command::OpenDirect { identifier, text } => self.open_direct_identifier(&identifier, text),
            Command::Leave(room) => self.leave(&room),
            Command::CreateChannel(metadata) => self.create_channel(metadata),
            Command::CreateGroup {
                relay_url,
                group_id,
                metadata,
            } => self.create_group(relay_url, group_id, metadata),
            Command::EditGroupMetadata { group, fields } => self.edit_group_metadata(&group, &fields),
            Command::CreateInvite { group, code } => self.create_invite(&group, code),
            Command::PutUser {
                group,
                pubkey,
                role,
            } => self.put_user(&group, &pubkey, role.as_deref()),
            Command::DeleteEvent { group, event_id } => self.delete_event(&group, &event_id),
            Command::SetProfile(profile) => self.set_profile(profile),
            Command::Resolve(input) => self.resolve(input),
            Command::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, "command rejected");
            self.error(self.active_room(), e.to_string());
        }
    }

    fn activate(&mut self, room: RoomRef) {
        let key = room.stable_key();
        if self.track_room(room.clone()) {
            self.publish_list_for(room.kind());
        }
        if let Some(state) = self.rooms.get_mut(&key) {
            state.unread = 0;
        }
        self.active = Some(key.clone());
        self.notify(Notification::Activated {
            room,
            history: self.store.messages(&key).to_vec(),
        });
    }

    fn send_text(&mut self, room: &RoomRef, text: &str) -> Result<()> {
        let text = text.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return Err(Error::InvalidEvent("empty message".to_string()));
        }
        if !self.is_tracked(room) {
            return Err(Error::UnknownRoom(room.to_string()));
        }
        match room {
            RoomRef::Channel(id) => {
                let event = self.sign(
                    EventBuilder::new(Kind::from(CHANNEL_MESSAGE_KIND), text)
                        .tag(build_tag(&["e", id, "", "root"])?),
                )?;
                self.local_echo(room, &event);
                self.publish(event, PublishTarget::Configured, "message", Some(room.clone()));
            }
            RoomRef::Group(group) => {
                let event = self.group_event(GROUP_MESSAGE_KIND, group, Vec::new(), text)?;
                self.local_echo(room, &event);
                self.publish_to_group(event, group, "group message");
            }
            RoomRef::Direct(peer) => self.send_direct(*peer, text)?,
        }
        Ok(())
    }

    fn send_direct(&mut self, peer: PublicKey, text: &str) -> Result<()> {
        let now = now_seconds();
        let wrapped = wrap_message(&self.keys, &peer, text, now)?;
        let room = RoomRef::Direct(peer);
        if self.track_room(room.clone()) {
            self.publish_list(ListKind::Contacts);
        }

        self.echoes.record(&peer.to_hex(), text, now);
        let echo = ChatMessage {
            author: self.display_name(&self.me),
            pubkey: self.me.to_hex(),
            content: text.to_string(),
            timestamp: now,
            event_id: wrapped.event_id.clone(),
            room: room.clone(),
            is_mine: true,
        };
        self.accept_message(echo);

        self.emit(CoreEffect::PublishDirect {
            wrapped: Box::new(wrapped),
            recipient: peer,
            room,
        });
        Ok(())
    }

    fn join_channel(&mut self, id: &str) -> Result<()> {
        let id = id.trim().to_lowercase();
        if !is_hex_pubkey(&id) {
            return Err(Error::InvalidIdentifier(format!("channel id must be 64 hex chars: {}", id)));
        }
        self.activate(RoomRef::Channel(id));
        Ok(())
    }

    fn join_group(&mut self, group: GroupKey, invite_code: Option<String>) -> Result<()> {
        let room = RoomRef::Group(group.clone());
        let mut extra = Vec::new();
        if let Some(code) = invite_code.as_deref().filter(|c| !c.is_empty()) {
            extra.push(build_tag(&["code", code])?);
        }
        let request = self.group_event(GROUP_JOIN_REQUEST_KIND, &group, extra, "")?;
        self.publish_to_group(request, &group, "join request");
        self.activate(room);
        Ok(())
    }

    fn open_direct_identifier(&mut self, identifier: &str, text: Option<String>) -> Result<()> {
        match parse_identifier(identifier)? {
            Identifier::PublicKey { pubkey, .. } => self.open_direct(pubkey, text),
            Identifier::Nip05 { .. } => {
                self.emit(CoreEffect::Resolve {
                    input: identifier.to_string(),
                    purpose: ResolvePurpose::OpenDirect { text },
                });
                Ok(())
            }
        }
    }

    fn open_direct(&mut self, peer: PublicKey, text: Option<String>) -> Result<()> {
        let room = RoomRef::Direct(peer);
        self.activate(room);
        if !self.names.contains_key(&peer) {
            self.emit(CoreEffect::FetchProfiles(vec![peer]));
        }
        match text {
            Some(text) if !text.trim().is_empty() => self.send_direct(peer, &text),
            _ => Ok(()),
        }
    }

    fn leave(&mut self, room: &RoomRef) -> Result<()> {
        if !self.is_tracked(room) {
            self.status(None, format!("not in {}", room));
            return Ok(());
        }
        if let RoomRef::Group(group) = room {
            let request = self.group_event(GROUP_LEAVE_REQUEST_KIND, group, Vec::new(), "")?;
            self.publish_to_group(request, group, "leave request");
        }
        self.untrack_room(room);
        if let Some(left) = self.awaiting_lists.get_mut(&list_kind_for(room.kind())) {
            left.push(room.clone());
        }
        self.publish_list_for(room.kind());
        self.notify_rooms();
        Ok(())
    }

    fn create_channel(&mut self, metadata: ChannelMetadata) -> Result<()> {
        if metadata.name.trim().is_empty() {
            return Err(Error::InvalidEvent("channel name required".to_string()));
        }
        let content = serde_json::to_string(&metadata)?;
        let event = self.sign(EventBuilder::new(Kind::from(CHANNEL_CREATE_KIND), content))?;
        let room = RoomRef::Channel(event.id.to_hex());
        self.dedup.insert(&event.id.to_hex(), now_seconds());
        self.publish(event, PublishTarget::Configured, "channel creation", Some(room.clone()));

        self.track_room(room.clone());
        self.set_title(&room, metadata.name);
        self.publish_list(ListKind::Channels);
        self.activate(room);
        Ok(())
    }

    fn create_group(
        &mut self,
        relay_url: String,
        group_id: Option<String>,
        metadata: GroupMetadataFields,
    ) -> Result<()> {
        let group_id = group_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| hex::encode(rand::random::<[u8; 6]>()));
        let group = GroupKey::new(relay_url, group_id);

        let create = self.group_event(GROUP_CREATE_KIND, &group, Vec::new(), "")?;
        self.publish_to_group(create, &group, "group creation");

        let room = RoomRef::Group(group.clone());
        self.track_room(room.clone());
        if let Some(name) = metadata.name.clone() {
            self.set_title(&room, name);
        }
        self.publish_list(ListKind::Groups);
        if metadata != GroupMetadataFields::default() {
            self.edit_group_metadata(&group, &metadata)?;
        }
        self.activate(room);
        Ok(())
    }

    fn edit_group_metadata(&mut self, group: &GroupKey, fields: &GroupMetadataFields) -> Result<()> {
        let mut tags = Vec::new();
        for (name, value) in [
            ("name", &fields.name),
            ("about", &fields.about),
            ("picture", &fields.picture),
        ] {
            if let Some(value) = value {
                tags.push(build_tag(&[name, value])?);
            }
        }
        if let Some(public) = fields.public {
            tags.push(build_tag(&[if public { "public" } else { "private" }])?);
        }
        if let Some(open) = fields.open {
            tags.push(build_tag(&[if open { "open" } else { "closed" }])?);
        }
        let event = self.group_event(GROUP_EDIT_METADATA_KIND, group, tags, "")?;
        self.publish_to_group(event, group, "metadata edit");
        Ok(())
    }

    fn create_invite(&mut self, group: &GroupKey, code: Option<String>) -> Result<()> {
        let code = code
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| hex::encode(rand::random::<[u8; 8]>()));
        let event = self.group_event(
            GROUP_CREATE_INVITE_KIND,
            group,
            vec![build_tag(&["code", &code])?],
            "",
        )?;
        self.publish_to_group(event, group, "invite");
        self.status(
            Some(RoomRef::Group(group.clone())),
            format!("invite code for {}: {}", group.group_id, code),
        );
        Ok(())
    }

    fn put_user(&mut self, group: &GroupKey, pubkey: &PublicKey, role: Option<&str>) -> Result<()> {
        let hex = pubkey.to_hex();
        let mut parts = vec!["p", hex.as_str()];
        if let Some(role) = role {
            parts.push(role);
        }
        let event = self.group_event(GROUP_PUT_USER_KIND, group, vec![build_tag(&parts)?], "")?;
        self.publish_to_group(event, group, "put user");
        Ok(())
    }

    fn delete_event(&mut self, group: &GroupKey, event_id: &str) -> Result<()> {
        let event = self.group_event(
            GROUP_DELETE_EVENT_KIND,
            group,
            vec![build_tag(&["e", event_id])?],
            "",
        )?;
        self.publish_to_group(event, group, "delete");
        Ok(())
    }

    /// Unset fields keep their current values.
    fn set_profile(&mut self, update: ProfileFields) -> Result<()> {
        let current = &self.config.profile;
        let profile = ProfileFields {
            name: update.name.or_else(|| current.name.clone()),
            display_name: update.display_name.or_else(|| current.display_name.clone()),
            about: update.about.or_else(|| current.about.clone()),
            picture: update.picture.or_else(|| current.picture.clone()),
        };
        let content = serde_json::to_string(&profile)?;
        let event = self.sign(EventBuilder::new(Kind::from(METADATA_KIND), content))?;
        if let Some(name) = profile_display_name(&profile) {
            self.names.insert(self.me, name);
        }
        self.config.profile = profile;
        self.publish(event, PublishTarget::Configured, "profile", None);
        Ok(())
    }

    fn resolve(&mut self, input: String) -> Result<()> {
        match parse_identifier(&input)? {
            Identifier::PublicKey { pubkey, .. } => {
                self.notify(Notification::Resolved { input, pubkey });
            }
            Identifier::Nip05 { .. } => self.emit(CoreEffect::Resolve {
                input,
                purpose: ResolvePurpose::Report,
            }),
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shutting_down = true;
        for key in self.subscriptions.cancel_all() {
            self.emit(CoreEffect::Unsubscribe { key });
        }
        self.emit(CoreEffect::Shutdown);
    }

    // ---- room tracking --------------------------------------------------

    /// Track `room`, seeding its history from the log and starting its
    /// subscription. Returns `false` if it was already tracked.
    fn track_room(&mut self, room: RoomRef) -> bool {
        let key = room.stable_key();
        if self.rooms.contains_key(&key) {
            return false;
        }
        self.rooms.insert(
            key.clone(),
            RoomState {
                room: room.clone(),
                title: None,
                unread: 0,
            },
        );
        self.order.push(key.clone());
        self.seed_history(&room);

        if room.kind() != RoomKind::Direct {
            let generation = self.subscriptions.start(&key);
            self.emit(CoreEffect::Subscribe {
                key,
                generation,
                room: room.clone(),
            });
        }
        tracing::info!(room = %room, "tracking room");
        self.notify(Notification::RoomAdded(room));
        true
    }

    fn untrack_room(&mut self, room: &RoomRef) -> bool {
        let key = room.stable_key();
        if self.rooms.remove(&key).is_none() {
            return false;
        }
        self.order.retain(|k| k != &key);
        if self.subscriptions.cancel(&key) {
            self.emit(CoreEffect::Unsubscribe { key: key.clone() });
        }
        self.store.remove_room(&key);
        if let RoomRef::Group(group) = room {
            self.selector.forget(group);
        }
        if self.active.as_deref() == Some(key.as_str()) {
            self.active = None;
        }
        tracing::info!(room = %room, "stopped tracking room");
        self.notify(Notification::RoomRemoved(room.clone()));
        true
    }

    fn seed_history(&mut self, room: &RoomRef) {
        let key = room.stable_key();
        let me = self.me.to_hex();
        match self.log.load_recent(room, self.store.max_per_room()) {
            Ok(history) => {
                for mut message in history {
                    message.is_mine = !message.pubkey.is_empty() && me.starts_with(&message.pubkey);
                    self.store.insert(&key, message);
                }
            }
            Err(e) => tracing::warn!(room = %room, error = %e, "failed to load history"),
        }
    }

    fn set_title(&mut self, room: &RoomRef, title: String) {
        if title.trim().is_empty() {
            return;
        }
        if let Some(state) = self.rooms.get_mut(&room.stable_key()) {
            if state.title.as_deref() == Some(title.as_str()) {
                return;
            }
            state.title = Some(title.clone());
        }
        self.notify(Notification::RoomTitle {
            room: room.clone(),
            title,
        });
    }

    fn tracked_of_kind(&self, kind: RoomKind) -> Vec<RoomRef> {
        self.rooms()
            .into_iter()
            .filter(|r| r.kind() == kind)
            .collect()
    }

    // ---- publishing -----------------------------------------------------

    fn sign(&self, builder: EventBuilder) -> Result<Event> {
        builder
            .build(self.me)
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::InvalidEvent(e.to_string()))
    }

    /// A group write: `h` tag, the given tags, then causal references.
    fn group_event(
        &self,
        kind: u16,
        group: &GroupKey,
        extra: Vec<Tag>,
        content: &str,
    ) -> Result<Event> {
        let mut tags = vec![build_tag(&["h", &group.group_id])?];
        tags.extend(extra);
        tags.extend(self.selector.reference_tags(group)?);
        self.sign(EventBuilder::new(Kind::from(kind), content).tags(tags))
    }

    fn publish(&self, event: Event, target: PublishTarget, label: &str, room: Option<RoomRef>) {
        self.emit(CoreEffect::Publish {
            event: Box::new(event),
            target,
            label: label.to_string(),
            room,
        });
    }

    fn publish_to_group(&self, event: Event, group: &GroupKey, label: &str) {
        self.publish(
            event,
            PublishTarget::Relay(group.relay_url.clone()),
            label,
            Some(RoomRef::Group(group.clone())),
        );
    }

    fn publish_list_for(&mut self, kind: RoomKind) {
        self.publish_list(list_kind_for(kind));
    }

    /// Republish `list` from current state with a version that beats every copy seen so far.
    fn publish_list(&mut self, list: ListKind) {
        if self.awaiting_lists.contains_key(&list) {
            tracing::debug!(list = list.as_str(), "holding list until the relay copy arrives");
            return;
        }
        let content = self.list_content(list);
        let version = self.lists.next_version(list, now_seconds());
        match build_list_event(&self.keys, &content, version) {
            Ok(event) => {
                tracing::debug!(list = list.as_str(), version, "republishing list");
                self.publish(
                    event,
                    PublishTarget::Configured,
                    &format!("{} list", list.as_str()),
                    None,
                );
            }
            Err(e) => tracing::warn!(list = list.as_str(), error = %e, "failed to build list"),
        }
    }

    fn list_content(&self, list: ListKind) -> ListContent {
        let rooms = self.rooms();
        match list {
            ListKind::Contacts => ListContent::Contacts(
                rooms
                    .iter()
                    .filter_map(|r| match r {
                        RoomRef::Direct(pk) => Some(*pk),
                        _ => None,
                    })
                    .collect(),
            ),
            ListKind::Channels => ListContent::Channels(
                rooms
                    .iter()
                    .filter_map(|r| match r {
                        RoomRef::Channel(id) => Some(id.clone()),
                        _ => None,
                    })
                    .collect(),
            ),
            ListKind::Groups => ListContent::Groups(
                rooms
                    .iter()
                    .filter_map(|r| r.as_group().cloned())
                    .collect(),
            ),
        }
    }

    // ---- intake ---------------------------------------------------------

    fn local_echo(&mut self, room: &RoomRef, event: &Event) {
        let message =
            ChatMessage::from_event(event, room.clone(), &self.me, self.display_name(&self.me));
        if let RoomRef::Group(group) = room {
            self.selector.observe(group, &message.event_id);
        }
        self.accept_message(message);
    }

    /// Dedup, store, log and announce one message. Returns `false` if it was dropped.
    fn accept_message(&mut self, message: ChatMessage) -> bool {
        let key = message.room.stable_key();
        let Some(room) = self.rooms.get(&key).map(|s| s.room.clone()) else {
            return false;
        };
        if !self.dedup.insert(&message.event_id, now_seconds()) {
            tracing::debug!(event = %message.event_id, "dropping duplicate");
            return false;
        }
        if self.store.contains(&key, &message.event_id) {
            tracing::debug!(event = %message.event_id, "already in history");
            return false;
        }

        if !self.store.insert(&key, message.clone()) {
            return false;
        }
        let name = match self.me.to_hex() == message.pubkey {
            true => self.display_name(&self.me),
            false => message.author.clone(),
        };
        if let Err(e) = self.log.append(&room, &message, &name) {
            tracing::warn!(room = %room, error = %e, "failed to append to log");
        }

        let active = self.active.as_deref() == Some(key.as_str());
        let mut unread = 0;
        if let Some(state) = self.rooms.get_mut(&key) {
            if !active && !message.is_mine {
                state.unread += 1;
            }
            unread = state.unread;
        }
        self.notify(Notification::Message {
            message,
            active,
            unread,
        });
        true
    }

    fn accept_room_event(&mut self, key: &str, event: &Event) {
        let Some(room) = self.rooms.get(key).map(|s| s.room.clone()) else {
            return;
        };
        let kind = event.kind.as_u16();
        match &room {
            RoomRef::Channel(channel_id) => match kind {
                CHANNEL_MESSAGE_KIND => {
                    let in_channel = event.tags.iter().any(|t| {
                        let parts = t.as_slice();
                        parts.first().map(|s| s.as_str()) == Some("e")
                            && parts.get(1) == Some(channel_id)
                    });
                    if !in_channel {
                        tracing::debug!(event = %event.id, "channel message for another channel");
                        return;
                    }
                    let author = self.display_name(&event.pubkey);
                    self.accept_message(ChatMessage::from_event(event, room.clone(), &self.me, author));
                    self.request_profile(&event.pubkey);
                }
                CHANNEL_CREATE_KIND | CHANNEL_METADATA_KIND => {
                    let for_us = (kind == CHANNEL_CREATE_KIND && event.id.to_hex() == *channel_id)
                        || (kind == CHANNEL_METADATA_KIND
                            && tag_value(event.tags.iter(), "e") == Some(channel_id.as_str()));
                    if !for_us {
                        return;
                    }
                    match serde_json::from_str::<ChannelMetadata>(&event.content) {
                        Ok(metadata) => self.set_title(&room, metadata.name),
                        Err(e) => tracing::debug!(event = %event.id, error = %e, "bad channel metadata"),
                    }
                }
                _ => {}
            },
            RoomRef::Group(group) => match kind {
                GROUP_METADATA_KIND => {
                    if tag_value(event.tags.iter(), "d") != Some(group.group_id.as_str()) {
                        return;
                    }
                    if let Some(name) = tag_value(event.tags.iter(), "name") {
                        let name = name.to_string();
                        self.set_title(&room, name);
                    }
                }
                _ if tag_value(event.tags.iter(), "h") == Some(group.group_id.as_str()) => {
                    self.selector.observe(group, &event.id.to_hex());
                    if kind == GROUP_MESSAGE_KIND {
                        let author = self.display_name(&event.pubkey);
                        self.accept_message(ChatMessage::from_event(event, room.clone(), &self.me, author));
                        self.request_profile(&event.pubkey);
                    }
                }
                _ => {}
            },
            RoomRef::Direct(_) => {}
        }
    }

    fn accept_direct(&mut self, message: UnwrappedMessage) {
        let peer_hex = message.peer.to_hex();
        let is_mine = message.sender == self.me;
        if is_mine && self.echoes.consume(&peer_hex, &message.content) {
            self.dedup.insert(&message.event_id, now_seconds());
            tracing::debug!(peer = %peer_hex, "suppressed echo of own message");
            return;
        }
        if self.dedup.contains(&message.event_id) {
            tracing::debug!(event = %message.event_id, "dropping duplicate");
            return;
        }

        let room = RoomRef::Direct(message.peer);
        if self.track_room(room.clone()) {
            self.publish_list(ListKind::Contacts);
            self.notify_rooms();
        }
        self.request_profile(&message.peer);

        let chat = ChatMessage {
            author: self.display_name(&message.sender),
            pubkey: message.sender.to_hex(),
            content: message.content,
            timestamp: message.timestamp,
            event_id: message.event_id,
            room,
            is_mine,
        };
        self.accept_message(chat);
    }

    fn request_profile(&mut self, pubkey: &PublicKey) {
        if self.names.contains_key(pubkey) {
            return;
        }
        // Placeholder until the fetch answers, so each pubkey is asked for once
        let fallback = self.display_name(pubkey);
        self.names.insert(*pubkey, fallback);
        self.emit(CoreEffect::FetchProfiles(vec![*pubkey]));
    }

    /// Apply a relay list if it is newer than what we have, reconciling rooms and subscriptions.
    fn apply_list(&mut self, list: VersionedList) {
        let kind = list.content.kind();
        let left_early = self.awaiting_lists.remove(&kind);
        if !self.lists.offer(&list) {
            if let Some(left) = left_early {
                self.settle_list(kind, &left);
            }
            return;
        }
        let current = self.tracked_of_kind(room_kind_for(kind));
        let incoming: Vec<RoomRef> = match list.content {
            ListContent::Contacts(pks) => pks.into_iter().map(RoomRef::Direct).collect(),
            ListContent::Channels(ids) => ids.into_iter().map(RoomRef::Channel).collect(),
            ListContent::Groups(groups) => groups.into_iter().map(RoomRef::Group).collect(),
        };

        // First copy of the session: keep rooms joined meanwhile, drop rooms left meanwhile
        let target = match &left_early {
            Some(left) => {
                let mut merged: Vec<RoomRef> = incoming
                    .iter()
                    .filter(|r| !left.contains(r) || current.contains(r))
                    .cloned()
                    .collect();
                for room in &current {
                    if !merged.contains(room) {
                        merged.push(room.clone());
                    }
                }
                merged
            }
            None => incoming.clone(),
        };

        let diff = ListDiff::between(&current, &target);
        tracing::info!(
            list = kind.as_str(),
            version = list.version,
            added = diff.added.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            "applying list"
        );
        for room in &diff.removed {
            self.untrack_room(room);
        }
        let mut unnamed = Vec::new();
        for room in diff.added {
            if let RoomRef::Direct(pk) = &room {
                if !self.names.contains_key(pk) {
                    unnamed.push(*pk);
                }
            }
            self.track_room(room);
        }
        if !unnamed.is_empty() {
            for pk in &unnamed {
                let fallback = self.display_name(pk);
                self.names.insert(*pk, fallback);
            }
            self.emit(CoreEffect::FetchProfiles(unnamed));
        }

        self.notify(Notification::ListApplied {
            list: kind,
            version: list.version,
            entries: target.len(),
        });
        self.notify_rooms();

        if !ListDiff::between(&incoming, &target).is_empty() {
            self.publish_list(kind);
        }
    }

    /// The fetch for `kind` ended without a usable copy. Publish local changes made while waiting.
    fn settle_list(&mut self, kind: ListKind, left: &[RoomRef]) {
        if !left.is_empty() || !self.tracked_of_kind(room_kind_for(kind)).is_empty() {
            self.publish_list(kind);
        }
    }

    // ---- task events ----------------------------------------------------

    pub fn process_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::SubscriptionOpened { key, generation } => {
                self.subscriptions.opened(&key, generation);
            }
            TaskEvent::RoomEvent {
                key,
                generation,
                event,
            } => {
                if !self.subscriptions.is_current(&key, generation) {
                    tracing::debug!(key, generation, "event from stale stream");
                    return;
                }
                self.accept_room_event(&key, &event);
            }
            TaskEvent::DirectMessage {
                generation,
                message,
            } => {
                if !self.subscriptions.is_current(INBOX_KEY, generation) {
                    return;
                }
                self.accept_direct(message);
            }
            TaskEvent::DirectMessageRejected { reason, .. } => {
                tracing::debug!(%reason, "gift wrap discarded");
            }
            TaskEvent::StreamEnded {
                key,
                generation,
                reason,
            } => {
                if self.subscriptions.ended(&key, generation) {
                    let room = self.rooms.get(&key).map(|s| s.room.clone());
                    self.status(
                        room,
                        format!(
                            "connection lost ({}), retrying in {}s",
                            reason,
                            RECONNECT_DELAY.as_secs()
                        ),
                    );
                    self.emit(CoreEffect::ScheduleReconnect {
                        key,
                        generation,
                        delay: RECONNECT_DELAY,
                    });
                }
            }
            TaskEvent::ReconnectDue { key, generation } => {
                let still_tracked =
                    !self.shutting_down && (key == INBOX_KEY || self.rooms.contains_key(&key));
                let Some(next) = self.subscriptions.reconnect_due(&key, generation, still_tracked)
                else {
                    return;
                };
                if key == INBOX_KEY {
                    self.emit(CoreEffect::SubscribeInbox {
                        generation: next,
                        since: self.started_at,
                    });
                } else if let Some(state) = self.rooms.get(&key) {
                    self.emit(CoreEffect::Subscribe {
                        key: key.clone(),
                        generation: next,
                        room: state.room.clone(),
                    });
                }
            }
            TaskEvent::PublishFinished {
                label,
                room,
                report,
            } => {
                if !report.accepted() {
                    self.error(room, format!("{}: no relay accepted the event", label));
                } else if report.is_partial() {
                    tracing::warn!(
                        %label,
                        ok = report.success.len(),
                        failed = report.failed.len(),
                        "publish partially failed"
                    );
                }
            }
            TaskEvent::DirectPublishFinished { room, result } => match result {
                Err(reason) => self.error(Some(room), reason),
                Ok(report) if report.is_partial() => {
                    let text = if report.recipient.accepted() {
                        "message sent; some relays failed".to_string()
                    } else {
                        "recipient relays unreachable; message kept in your history".to_string()
                    };
                    self.status(Some(room), text);
                }
                Ok(_) => {}
            },
            TaskEvent::ListFetched(list) => self.apply_list(list),
            TaskEvent::ListMissing(list) => {
                if let Some(left) = self.awaiting_lists.remove(&list) {
                    self.settle_list(list, &left);
                }
            }
            TaskEvent::ListFetchFailed { list, reason } => {
                tracing::warn!(list = list.as_str(), %reason, "list fetch failed");
                self.status(None, format!("could not fetch {} list: {}", list.as_str(), reason));
                if let Some(left) = self.awaiting_lists.remove(&list) {
                    self.settle_list(list, &left);
                }
            }
            TaskEvent::ProfileFetched { pubkey, profile } => {
                if let Some(name) = profile_display_name(&profile) {
                    if self.names.get(&pubkey) != Some(&name) {
                        self.names.insert(pubkey, name.clone());
                        self.notify(Notification::DisplayName { pubkey, name });
                    }
                }
            }
            TaskEvent::Resolved {
                input,
                purpose,
                result,
            } => match result {
                Ok(pubkey) => match purpose {
                    ResolvePurpose::Report => {
                        self.notify(Notification::Resolved { input, pubkey });
                    }
                    ResolvePurpose::OpenDirect { text } => {
                        if let Err(e) = self.open_direct(pubkey, text) {
                            self.error(None, e.to_string());
                        }
                    }
                },
                Err(reason) => self.error(None, format!("could not resolve {}: {}", input, reason)),
            },
        }
    }
}

fn profile_display_name(profile: &ProfileFields) -> Option<String> {
    profile
        .display_name
        .as_ref()
        .or(profile.name.as_ref())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn list_kind_for(kind: RoomKind) -> ListKind {
    match kind {
        RoomKind::Channel => ListKind::Channels,
        RoomKind::Group => ListKind::Groups,
        RoomKind::Direct => ListKind::Contacts,
    }
}

fn room_kind_for(list: ListKind) -> RoomKind {
    match list {
        ListKind::Channels => RoomKind::Channel,
        ListKind::Groups => RoomKind::Group,
        ListKind::Contacts => RoomKind::Direct,
    }
}
