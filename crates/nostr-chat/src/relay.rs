//! Shared relay connection pool and the background stream tasks.

use crate::events::TaskEvent;
use crate::gift_wrap::{self, WrappedMessage};
use crate::lists::{parse_list_event, ListKind};
use crate::subscription::INBOX_KEY;
use crate::types::{
    ProfileFields, RoomRef, CHANNEL_CREATE_KIND, CHANNEL_METADATA_KIND, CHANNEL_MESSAGE_KIND,
    GIFT_WRAP_KIND, GROUP_ADMINS_KIND, GROUP_CREATE_INVITE_KIND, GROUP_DELETE_EVENT_KIND,
    GROUP_EDIT_METADATA_KIND, GROUP_JOIN_REQUEST_KIND, GROUP_LEAVE_REQUEST_KIND,
    GROUP_MEMBERS_KIND, GROUP_MESSAGE_KIND, GROUP_METADATA_KIND, GROUP_PUT_USER_KIND,
    METADATA_KIND, RELAY_LIST_KIND,
};
use crate::{Error, Result};
use futures::future::join_all;
use nostr::{Alphabet, Event, EventId, Filter, Keys, Kind, PublicKey, SingleLetterTag, Timestamp};
use nostr_sdk::{Client, ClientOptions, RelayMessage, RelayPoolNotification, SubscriptionId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, OnceCell};

/// The DM `since` bound is moved back by this much to cover gift-wrap jitter.
pub const DM_SINCE_RELAXATION_SECS: u64 = 3 * 24 * 60 * 60;
/// Deadline for one fan-out publish.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(8);
/// Backfill depth for a room subscription.
pub const ROOM_HISTORY_LIMIT: usize = 200;

/// Per-relay outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub success: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    pub fn accepted(&self) -> bool {
        !self.success.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.success.is_empty() && !self.failed.is_empty()
    }

    fn failure(relays: &[String], reason: &str) -> Self {
        Self {
            success: Vec::new(),
            failed: relays
                .iter()
                .map(|r| (r.clone(), reason.to_string()))
                .collect(),
        }
    }
}

/// Outcome of publishing both envelopes of a direct message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectPublishReport {
    pub recipient: PublishReport,
    pub own: PublishReport,
}

impl DirectPublishReport {
    /// At least one relay accepted at least one envelope.
    pub fn delivered(&self) -> bool {
        self.recipient.accepted() || self.own.accepted()
    }

    /// Delivered, but some relay or one whole envelope failed.
    pub fn is_partial(&self) -> bool {
        self.delivered()
            && (!self.recipient.accepted()
                || !self.own.accepted()
                || !self.recipient.failed.is_empty()
                || !self.own.failed.is_empty())
    }
}

/// One relay-side filter of a logical stream and the relays it is sent to.
#[derive(Debug, Clone)]
pub struct StreamFilter {
    pub filter: Filter,
    pub relays: Vec<String>,
}

/// Filters for a room. Groups need two: messages are `h`-tagged, relay metadata `d`-tagged.
pub fn room_filters(room: &RoomRef, configured: &[String]) -> Vec<StreamFilter> {
    match room {
        RoomRef::Channel(id) => {
            let messages = Filter::new()
                .kinds([
                    Kind::from(CHANNEL_MESSAGE_KIND),
                    Kind::from(CHANNEL_METADATA_KIND),
                ])
                .custom_tag(SingleLetterTag::lowercase(Alphabet::E), id.clone())
                .limit(ROOM_HISTORY_LIMIT);
            let mut filters = vec![StreamFilter {
                filter: messages,
                relays: configured.to_vec(),
            }];
            if let Ok(event_id) = EventId::from_hex(id) {
                filters.push(StreamFilter {
                    filter: Filter::new()
                        .kind(Kind::from(CHANNEL_CREATE_KIND))
                        .id(event_id),
                    relays: configured.to_vec(),
                });
            }
            filters
        }
        RoomRef::Group(group) => {
            let relays = vec![group.relay_url.clone()];
            let messages = Filter::new()
                .kinds([
                    Kind::from(GROUP_MESSAGE_KIND),
                    Kind::from(GROUP_PUT_USER_KIND),
                    Kind::from(GROUP_EDIT_METADATA_KIND),
                    Kind::from(GROUP_DELETE_EVENT_KIND),
                    Kind::from(GROUP_CREATE_INVITE_KIND),
                    Kind::from(GROUP_JOIN_REQUEST_KIND),
                    Kind::from(GROUP_LEAVE_REQUEST_KIND),
                ])
                .custom_tag(SingleLetterTag::lowercase(Alphabet::H), group.group_id.clone())
                .limit(ROOM_HISTORY_LIMIT);
            let metadata = Filter::new()
                .kinds([
                    Kind::from(GROUP_METADATA_KIND),
                    Kind::from(GROUP_ADMINS_KIND),
                    Kind::from(GROUP_MEMBERS_KIND),
                ])
                .custom_tag(SingleLetterTag::lowercase(Alphabet::D), group.group_id.clone());
            vec![
                StreamFilter {
                    filter: messages,
                    relays: relays.clone(),
                },
                StreamFilter {
                    filter: metadata,
                    relays,
                },
            ]
        }
        // Direct messages arrive through the inbox
        RoomRef::Direct(_) => Vec::new(),
    }
}

/// Gift wraps addressed to `me`, with `since` relaxed for timestamp jitter.
pub fn inbox_filter(me: &PublicKey, since: u64) -> Filter {
    Filter::new()
        .kind(Kind::from(GIFT_WRAP_KIND))
        .custom_tag(SingleLetterTag::lowercase(Alphabet::P), me.to_hex())
        .since(Timestamp::from(since.saturating_sub(DM_SINCE_RELAXATION_SECS)))
}

/// Write relays from a kind-10002 relay list. Unmarked entries count as both read and write.
pub fn write_relays_from_event(event: &Event) -> Vec<String> {
    let mut relays = Vec::new();
    for tag in event.tags.iter() {
        let parts = tag.as_slice();
        if parts.first().map(|s| s.as_str()) != Some("r") {
            continue;
        }
        let Some(url) = parts.get(1) else {
            continue;
        };
        let is_write = match parts.get(2).map(|s| s.as_str()) {
            None | Some("write") | Some("") => true,
            _ => false,
        };
        if is_write && !relays.contains(url) {
            relays.push(url.clone());
        }
    }
    relays
}

/// One logical connection per relay URL, shared by every stream and publish.
pub struct RelayPool {
    client: Client,
    configured: Vec<String>,
    connections: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl RelayPool {
    pub fn new(keys: Keys, relays: Vec<String>) -> Self {
        let client = Client::builder()
            .signer(keys)
            .opts(ClientOptions::new().automatic_authentication(true))
            .build();
        Self {
            client,
            configured: relays,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn configured_relays(&self) -> &[String] {
        &self.configured
    }

    /// Connect to `url` once. Concurrent callers share the first attempt; a
    /// failed attempt leaves the slot empty so the next caller retries.
    pub async fn ensure_relay(&self, url: &str) -> Result<()> {
        let cell = {
            let mut connections = self
                .connections
                .lock()
                .map_err(|_| Error::Relay("connection table poisoned".to_string()))?;
            connections
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_try_init(|| async {
            self.client
                .add_relay(url)
                .await
                .map_err(|e| Error::Relay(format!("{}: {}", url, e)))?;
            self.client
                .try_connect_relay(url, CONNECT_TIMEOUT)
                .await
                .map_err(|e| Error::Relay(format!("{}: {}", url, e)))?;
            tracing::info!(relay = url, "connected");
            Ok::<(), Error>(())
        })
        .await?;
        Ok(())
    }

    /// Connect to every relay in `urls` concurrently. Returns the ones that connected.
    pub async fn ensure_relays(&self, urls: &[String]) -> Vec<String> {
        let attempts = urls.iter().map(|url| async move {
            match self.ensure_relay(url).await {
                Ok(()) => Some(url.clone()),
                Err(e) => {
                    tracing::warn!(relay = %url, error = %e, "relay unavailable");
                    None
                }
            }
        });
        join_all(attempts).await.into_iter().flatten().collect()
    }

    /// Connect to every configured relay up front. Access-gated relays issue
    /// their AUTH challenge on connect and the signer answers it, so the inbox
    /// is served as soon as it subscribes. Failures are logged and skipped.
    pub async fn pre_authenticate(&self) -> Vec<String> {
        let configured = self.configured.clone();
        self.ensure_relays(&configured).await
    }

    async fn subscribe(&self, id: &SubscriptionId, spec: &StreamFilter) -> HashSet<String> {
        let connected = self.ensure_relays(&spec.relays).await;
        if connected.is_empty() {
            return HashSet::new();
        }
        match self
            .client
            .subscribe_with_id_to(connected, id.clone(), spec.filter.clone(), None)
            .await
        {
            Ok(output) => {
                for (relay, reason) in output.failed.iter() {
                    tracing::warn!(%relay, %reason, subscription = %id, "subscribe rejected");
                }
                output.success.iter().map(|r| r.to_string()).collect()
            }
            Err(e) => {
                tracing::warn!(subscription = %id, error = %e, "subscribe failed");
                HashSet::new()
            }
        }
    }

    /// Publish `event` to `relays` with a deadline. Never fails; the report says where it landed.
    pub async fn publish(&self, event: &Event, relays: &[String]) -> PublishReport {
        let connected = self.ensure_relays(relays).await;
        let mut report = PublishReport::default();
        for relay in relays.iter().filter(|r| !connected.contains(r)) {
            report
                .failed
                .push((relay.clone(), "not connected".to_string()));
        }
        if connected.is_empty() {
            return report;
        }

        match tokio::time::timeout(PUBLISH_TIMEOUT, self.client.send_event_to(connected.clone(), event))
            .await
        {
            Ok(Ok(output)) => {
                report
                    .success
                    .extend(output.success.iter().map(|r| r.to_string()));
                report.failed.extend(
                    output
                        .failed
                        .iter()
                        .map(|(r, reason)| (r.to_string(), reason.to_string())),
                );
            }
            Ok(Err(e)) => {
                report
                    .failed
                    .extend(PublishReport::failure(&connected, &e.to_string()).failed);
            }
            Err(_) => {
                report
                    .failed
                    .extend(PublishReport::failure(&connected, "timed out").failed);
            }
        }

        for (relay, reason) in &report.failed {
            tracing::warn!(%relay, %reason, event = %event.id, "publish rejected");
        }
        report
    }

    /// Publish both envelopes of a direct message concurrently: the recipient
    /// copy to the recipient's write relays (or ours when none are published),
    /// the self copy to our configured relays.
    pub async fn publish_direct(
        &self,
        wrapped: &WrappedMessage,
        recipient: &PublicKey,
    ) -> Result<DirectPublishReport> {
        let mut recipient_relays = self.discover_write_relays(recipient).await;
        if recipient_relays.is_empty() {
            recipient_relays = self.configured.clone();
        }

        let (recipient_report, own_report) = tokio::join!(
            self.publish(&wrapped.recipient_wrap, &recipient_relays),
            self.publish(&wrapped.self_wrap, &self.configured),
        );
        let report = DirectPublishReport {
            recipient: recipient_report,
            own: own_report,
        };

        if !report.delivered() {
            return Err(Error::PublishFailed(format!(
                "direct message to {} reached no relay",
                recipient.to_hex()
            )));
        }
        if report.is_partial() {
            tracing::warn!(
                recipient_ok = report.recipient.success.len(),
                own_ok = report.own.success.len(),
                "direct message partially published"
            );
        }
        Ok(report)
    }

    /// Write relays advertised in `pubkey`'s relay list, if any.
    pub async fn discover_write_relays(&self, pubkey: &PublicKey) -> Vec<String> {
        let filter = Filter::new()
            .kind(Kind::from(RELAY_LIST_KIND))
            .author(*pubkey)
            .limit(1);
        match self.fetch_latest(filter).await {
            Ok(Some(event)) => write_relays_from_event(&event),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::debug!(pubkey = %pubkey, error = %e, "relay list lookup failed");
                Vec::new()
            }
        }
    }

    /// Newest event matching `filter` across the configured relays.
    pub async fn fetch_latest(&self, filter: Filter) -> Result<Option<Event>> {
        let connected = self.pre_authenticate().await;
        if connected.is_empty() {
            return Err(Error::Relay("no relay reachable".to_string()));
        }
        let events = self
            .client
            .fetch_events_from(connected, filter, FETCH_TIMEOUT)
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        Ok(events.into_iter().max_by_key(|e| e.created_at))
    }

    /// Latest kind-0 profile of each pubkey that has one.
    pub async fn fetch_profiles(&self, pubkeys: &[PublicKey]) -> Result<Vec<(PublicKey, ProfileFields)>> {
        if pubkeys.is_empty() {
            return Ok(Vec::new());
        }
        let connected = self.pre_authenticate().await;
        if connected.is_empty() {
            return Err(Error::Relay("no relay reachable".to_string()));
        }
        let filter = Filter::new()
            .kind(Kind::from(METADATA_KIND))
            .authors(pubkeys.iter().copied());
        let events = self
            .client
            .fetch_events_from(connected, filter, FETCH_TIMEOUT)
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;

        let mut newest: HashMap<PublicKey, Event> = HashMap::new();
        for event in events.into_iter() {
            match newest.get(&event.pubkey) {
                Some(existing) if existing.created_at >= event.created_at => {}
                _ => {
                    newest.insert(event.pubkey, event);
                }
            }
        }
        Ok(newest
            .into_iter()
            .filter_map(|(pk, event)| match serde_json::from_str::<ProfileFields>(&event.content) {
                Ok(profile) => Some((pk, profile)),
                Err(e) => {
                    tracing::debug!(pubkey = %pk, error = %e, "unreadable profile");
                    None
                }
            })
            .collect())
    }

    /// Fetch and decode our own copy of `list`.
    pub async fn fetch_list(&self, keys: &Keys, list: ListKind) -> Result<Option<crate::lists::VersionedList>> {
        match self.fetch_latest(list.filter(keys.public_key())).await? {
            Some(event) => parse_list_event(&event, keys).map(Some),
            None => Ok(None),
        }
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId) {
        self.client.unsubscribe(id).await;
    }

    pub async fn shutdown(&self) {
        self.client.unsubscribe_all().await;
        self.client.shutdown().await;
        tracing::info!("relay pool shut down");
    }
}

fn subscription_id(generation: u64, index: usize) -> SubscriptionId {
    SubscriptionId::new(format!("nchat-{}-{}", generation, index))
}

/// What a stream does with each matching event.
enum StreamSink {
    Room,
    Inbox(Keys),
}

/// Spawn the stream task for a room. Dropping or firing the returned sender cancels it.
pub fn spawn_room_stream(
    pool: Arc<RelayPool>,
    key: String,
    generation: u64,
    room: RoomRef,
    tx: mpsc::UnboundedSender<TaskEvent>,
) -> oneshot::Sender<()> {
    let filters = room_filters(&room, pool.configured_relays());
    spawn_stream(pool, key, generation, filters, StreamSink::Room, tx)
}

/// Spawn the standing direct-message stream.
pub fn spawn_inbox_stream(
    pool: Arc<RelayPool>,
    keys: Keys,
    generation: u64,
    since: u64,
    tx: mpsc::UnboundedSender<TaskEvent>,
) -> oneshot::Sender<()> {
    let filters = vec![StreamFilter {
        filter: inbox_filter(&keys.public_key(), since),
        relays: pool.configured_relays().to_vec(),
    }];
    spawn_stream(
        pool,
        INBOX_KEY.to_string(),
        generation,
        filters,
        StreamSink::Inbox(keys),
        tx,
    )
}

fn spawn_stream(
    pool: Arc<RelayPool>,
    key: String,
    generation: u64,
    filters: Vec<StreamFilter>,
    sink: StreamSink,
    tx: mpsc::UnboundedSender<TaskEvent>,
) -> oneshot::Sender<()> {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(async move {
        let reason = run_stream(&pool, &key, generation, filters, sink, cancel_rx, &tx).await;
        if let Some(reason) = reason {
            tracing::info!(key = %key, generation, %reason, "stream ended");
            let _ = tx.send(TaskEvent::StreamEnded {
                key,
                generation,
                reason,
            });
        }
    });
    cancel_tx
}

/// Drive one logical stream until it closes or is cancelled. Returns the close
/// reason, or `None` when cancelled.
async fn run_stream(
    pool: &RelayPool,
    key: &str,
    generation: u64,
    filters: Vec<StreamFilter>,
    sink: StreamSink,
    mut cancel: oneshot::Receiver<()>,
    tx: &mpsc::UnboundedSender<TaskEvent>,
) -> Option<String> {
    // Inbox relays may require AUTH before serving kind 1059 to us
    if matches!(sink, StreamSink::Inbox(_)) {
        let ready = pool.pre_authenticate().await;
        tracing::info!(relays = ready.len(), "relay pool ready");
    }

    // Listen before sending REQs so nothing is missed
    let mut notifications = pool.client().notifications();

    let mut ids: Vec<SubscriptionId> = Vec::new();
    let mut live: HashSet<(String, String)> = HashSet::new();
    for (index, spec) in filters.iter().enumerate() {
        let id = subscription_id(generation, index);
        for relay in pool.subscribe(&id, spec).await {
            live.insert((id.to_string(), relay));
        }
        ids.push(id);
    }
    let id_strings: HashSet<String> = ids.iter().map(|id| id.to_string()).collect();

    if live.is_empty() {
        return Some("no relay accepted the subscription".to_string());
    }
    tracing::info!(key, generation, relays = live.len(), "subscribed");
    let _ = tx.send(TaskEvent::SubscriptionOpened {
        key: key.to_string(),
        generation,
    });

    let reason = loop {
        tokio::select! {
            _ = &mut cancel => {
                for id in &ids {
                    pool.unsubscribe(id).await;
                }
                tracing::debug!(key, generation, "stream cancelled");
                return None;
            }
            notification = notifications.recv() => match notification {
                Ok(RelayPoolNotification::Event { subscription_id, event, .. }) => {
                    if !id_strings.contains(&subscription_id.to_string()) {
                        continue;
                    }
                    let delivered = match &sink {
                        StreamSink::Room => tx.send(TaskEvent::RoomEvent {
                            key: key.to_string(),
                            generation,
                            event,
                        }),
                        StreamSink::Inbox(keys) => match gift_wrap::unwrap(&event, keys) {
                            Ok(message) => tx.send(TaskEvent::DirectMessage { generation, message }),
                            Err(e) => {
                                tracing::warn!(event = %event.id, error = %e, "failed to unwrap gift wrap");
                                tx.send(TaskEvent::DirectMessageRejected {
                                    generation,
                                    reason: e.to_string(),
                                })
                            }
                        },
                    };
                    if delivered.is_err() {
                        break "core stopped".to_string();
                    }
                }
                Ok(RelayPoolNotification::Message {
                    relay_url,
                    message: RelayMessage::Closed { subscription_id, message },
                }) => {
                    let id = subscription_id.to_string();
                    if !id_strings.contains(&id) {
                        continue;
                    }
                    tracing::warn!(key, relay = %relay_url, %message, "subscription closed by relay");
                    live.remove(&(id, relay_url.to_string()));
                    if live.is_empty() {
                        break format!("closed by relay: {}", message);
                    }
                }
                Ok(RelayPoolNotification::Shutdown) => break "relay pool shut down".to_string(),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(key, skipped, "notification stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break "notification stream closed".to_string(),
            }
        }
    };

    for id in &ids {
        pool.unsubscribe(id).await;
    }
    Some(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupKey;
    use crate::utils::build_tag;
    use nostr::EventBuilder;

    #[test]
    fn group_stream_uses_two_filters_on_its_own_relay() {
        let room = RoomRef::Group(GroupKey::new("wss://groups.example.com", "pizza"));
        let filters = room_filters(&room, &["wss://other.example.com".to_string()]);
        assert_eq!(filters.len(), 2);
        for f in &filters {
            assert_eq!(f.relays, vec!["wss://groups.example.com".to_string()]);
        }
        let json: Vec<String> = filters
            .iter()
            .map(|f| serde_json::to_string(&f.filter).unwrap())
            .collect();
        assert!(json[0].contains("\"#h\":[\"pizza\"]"));
        assert!(json[1].contains("\"#d\":[\"pizza\"]"));
    }

    #[test]
    fn channel_stream_targets_configured_relays() {
        let id = "ab".repeat(32);
        let relays = vec!["wss://a.example.com".to_string(), "wss://b.example.com".to_string()];
        let filters = room_filters(&RoomRef::Channel(id.clone()), &relays);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].relays, relays);
        assert!(serde_json::to_string(&filters[0].filter)
            .unwrap()
            .contains(&id));
    }

    #[test]
    fn inbox_since_is_relaxed() {
        let me = Keys::generate().public_key();
        let filter = inbox_filter(&me, 1_000_000);
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains(&format!("\"since\":{}", 1_000_000 - DM_SINCE_RELAXATION_SECS)));
        assert!(json.contains(&me.to_hex()));
        assert!(json.contains("1059"));
    }

    #[test]
    fn relay_list_write_markers() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::from(RELAY_LIST_KIND), "")
            .tags([
                build_tag(&["r", "wss://both.example.com"]).unwrap(),
                build_tag(&["r", "wss://write.example.com", "write"]).unwrap(),
                build_tag(&["r", "wss://read.example.com", "read"]).unwrap(),
            ])
            .build(keys.public_key())
            .sign_with_keys(&keys)
            .unwrap();
        assert_eq!(
            write_relays_from_event(&event),
            vec![
                "wss://both.example.com".to_string(),
                "wss://write.example.com".to_string()
            ]
        );
    }

    #[test]
    fn direct_report_classification() {
        let ok = PublishReport {
            success: vec!["wss://a".to_string()],
            failed: vec![],
        };
        let failed = PublishReport::failure(&["wss://b".to_string()], "down");

        let partial = DirectPublishReport {
            recipient: failed.clone(),
            own: ok.clone(),
        };
        assert!(partial.delivered());
        assert!(partial.is_partial());

        let total = DirectPublishReport {
            recipient: failed.clone(),
            own: failed,
        };
        assert!(!total.delivered());

        let full = DirectPublishReport {
            recipient: ok.clone(),
            own: ok,
        };
        assert!(full.delivered());
        assert!(!full.is_partial());
    }
}
