mod common;

use common::{eventually, wait_for, LocalRelay};
use nostr::{EventBuilder, Keys, Kind};
use nostr_chat::lists::build_list_event;
use nostr_chat::relay::{spawn_inbox_stream, spawn_room_stream};
use nostr_chat::utils::{build_tag, now_seconds};
use nostr_chat::{
    wrap_message, GroupKey, ListContent, ListKind, RelayPool, RoomRef, TaskEvent,
    CHANNEL_MESSAGE_KIND, GIFT_WRAP_KIND, GROUP_MESSAGE_KIND,
};
use std::sync::Arc;
use tokio::sync::mpsc;

fn pool(keys: &Keys, relay: &LocalRelay) -> Arc<RelayPool> {
    Arc::new(RelayPool::new(keys.clone(), vec![relay.url()]))
}

#[tokio::test]
async fn gift_wrapped_dm_reaches_recipient_inbox() {
    let relay = LocalRelay::new().await;
    let alice = Keys::generate();
    let bob = Keys::generate();

    let bob_pool = pool(&bob, &relay);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _cancel = spawn_inbox_stream(bob_pool.clone(), bob.clone(), 1, now_seconds(), tx);
    wait_for(&mut rx, |e| matches!(e, TaskEvent::SubscriptionOpened { .. }).then_some(())).await;

    let alice_pool = pool(&alice, &relay);
    let wrapped = wrap_message(&alice, &bob.public_key(), "hello bob", now_seconds()).unwrap();
    let report = alice_pool
        .publish_direct(&wrapped, &bob.public_key())
        .await
        .unwrap();
    assert!(report.delivered());
    // Two envelopes, neither signed by alice
    let wraps = relay.events_of_kind(GIFT_WRAP_KIND as u64);
    assert_eq!(wraps.len(), 2);
    assert!(wraps
        .iter()
        .all(|w| w["pubkey"].as_str() != Some(alice.public_key().to_hex().as_str())));

    let message = wait_for(&mut rx, |e| match e {
        TaskEvent::DirectMessage { message, .. } => Some(message.clone()),
        _ => None,
    })
    .await;
    assert_eq!(message.content, "hello bob");
    assert_eq!(message.sender, alice.public_key());
    assert_eq!(message.peer, alice.public_key());
    assert_eq!(message.event_id, wrapped.event_id);
}

#[tokio::test]
async fn room_stream_delivers_backlog_and_live_events() {
    let relay = LocalRelay::new().await;
    let author = Keys::generate();
    let reader = Keys::generate();
    let channel = "ab".repeat(32);

    let author_pool = pool(&author, &relay);
    let old = EventBuilder::new(Kind::from(CHANNEL_MESSAGE_KIND), "before")
        .tag(build_tag(&["e", &channel, "", "root"]).unwrap())
        .sign_with_keys(&author)
        .unwrap();
    assert!(author_pool.publish(&old, &[relay.url()]).await.accepted());

    let room = RoomRef::Channel(channel.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = spawn_room_stream(pool(&reader, &relay), room.stable_key(), 7, room.clone(), tx);

    let first = wait_for(&mut rx, |e| match e {
        TaskEvent::RoomEvent { event, generation, .. } if *generation == 7 => Some(event.content.clone()),
        _ => None,
    })
    .await;
    assert_eq!(first, "before");

    let live = EventBuilder::new(Kind::from(CHANNEL_MESSAGE_KIND), "after")
        .tag(build_tag(&["e", &channel, "", "root"]).unwrap())
        .sign_with_keys(&author)
        .unwrap();
    author_pool.publish(&live, &[relay.url()]).await;
    wait_for(&mut rx, |e| match e {
        TaskEvent::RoomEvent { event, .. } if event.content == "after" => Some(()),
        _ => None,
    })
    .await;

    let _ = cancel.send(());
    eventually(|| {
        let count = relay.subscription_count();
        async move { count == 0 }
    })
    .await;
}

#[tokio::test]
async fn relay_closed_ends_the_stream() {
    let relay = LocalRelay::new().await;
    let keys = Keys::generate();
    let group = GroupKey::new(relay.url(), "pizza");
    let room = RoomRef::Group(group.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _cancel = spawn_room_stream(pool(&keys, &relay), room.stable_key(), 3, room.clone(), tx);
    wait_for(&mut rx, |e| matches!(e, TaskEvent::SubscriptionOpened { .. }).then_some(())).await;

    relay.close_all_subscriptions("restricted: members only");
    let (key, generation) = wait_for(&mut rx, |e| match e {
        TaskEvent::StreamEnded { key, generation, .. } => Some((key.clone(), *generation)),
        _ => None,
    })
    .await;
    assert_eq!(key, room.stable_key());
    assert_eq!(generation, 3);
}

#[tokio::test]
async fn group_stream_is_scoped_to_its_relay_and_id() {
    let relay = LocalRelay::new().await;
    let keys = Keys::generate();
    let group = GroupKey::new(relay.url(), "pizza");
    let room = RoomRef::Group(group.clone());
    let pool = pool(&keys, &relay);

    for (id, text) in [("pizza", "mine"), ("pasta", "other")] {
        let event = EventBuilder::new(Kind::from(GROUP_MESSAGE_KIND), text)
            .tag(build_tag(&["h", id]).unwrap())
            .sign_with_keys(&keys)
            .unwrap();
        pool.publish(&event, &[relay.url()]).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _cancel = spawn_room_stream(pool.clone(), room.stable_key(), 1, room, tx);
    let content = wait_for(&mut rx, |e| match e {
        TaskEvent::RoomEvent { event, .. } => Some(event.content.clone()),
        _ => None,
    })
    .await;
    assert_eq!(content, "mine");
}

#[tokio::test]
async fn lists_round_trip_through_relay() {
    let relay = LocalRelay::new().await;
    let keys = Keys::generate();
    let pool = pool(&keys, &relay);
    let peer = Keys::generate().public_key();

    assert!(pool.fetch_list(&keys, ListKind::Contacts).await.unwrap().is_none());

    for (version, contacts) in [(100, vec![peer]), (200, vec![])] {
        let event = build_list_event(&keys, &ListContent::Contacts(contacts), version).unwrap();
        pool.publish(&event, &[relay.url()]).await;
    }

    let list = pool
        .fetch_list(&keys, ListKind::Contacts)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(list.version, 200);
    assert_eq!(list.content, ListContent::Contacts(vec![]));
}

#[tokio::test]
async fn unreachable_relay_is_reported_not_fatal() {
    let keys = Keys::generate();
    let pool = RelayPool::new(keys.clone(), vec!["ws://127.0.0.1:1".to_string()]);
    let event = EventBuilder::new(Kind::from(CHANNEL_MESSAGE_KIND), "x")
        .sign_with_keys(&keys)
        .unwrap();
    let report = pool.publish(&event, &["ws://127.0.0.1:1".to_string()]).await;
    assert!(!report.accepted());
    assert_eq!(report.failed.len(), 1);
}

#[tokio::test]
async fn inbox_connects_every_relay_before_subscribing() {
    let relay = LocalRelay::new().await;
    let bob = Keys::generate();
    let dead = "ws://127.0.0.1:1".to_string();
    let bob_pool = Arc::new(RelayPool::new(bob.clone(), vec![dead, relay.url()]));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _cancel = spawn_inbox_stream(bob_pool.clone(), bob.clone(), 1, now_seconds(), tx);
    wait_for(&mut rx, |e| matches!(e, TaskEvent::SubscriptionOpened { .. }).then_some(())).await;

    let live = bob_pool.client().relay(relay.url()).await.unwrap();
    assert!(live.is_connected());
    assert_eq!(relay.subscription_count(), 1);
}
