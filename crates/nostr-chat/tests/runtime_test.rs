mod common;

use common::{wait_for, LocalRelay};
use nostr::Keys;
use nostr_chat::{
    ChannelMetadata, ChatConfig, ChatHandle, Command, InMemoryLog, Notification, RoomRef, Runtime,
    CHANNELS_LIST_KIND,
};
use std::sync::Arc;
use tokio::sync::mpsc;

fn start(keys: &Keys, relay: &LocalRelay) -> (ChatHandle, mpsc::UnboundedReceiver<Notification>) {
    let config = ChatConfig {
        relays: vec![relay.url()],
        ..ChatConfig::default()
    };
    let (runtime, handle, notifications) =
        Runtime::new(keys.clone(), config, Arc::new(InMemoryLog::new()));
    tokio::spawn(runtime.run());
    (handle, notifications)
}

#[tokio::test]
async fn direct_message_between_two_clients() {
    let relay = LocalRelay::new().await;
    let alice = Keys::generate();
    let bob = Keys::generate();

    let (bob_handle, mut bob_rx) = start(&bob, &relay);
    // Wait for bob's inbox to be live before alice sends
    common::eventually(|| {
        let subs = relay.subscription_count();
        async move { subs >= 1 }
    })
    .await;

    let (alice_handle, mut alice_rx) = start(&alice, &relay);
    alice_handle
        .send(Command::OpenDirect {
            identifier: bob.public_key().to_hex(),
            text: Some("hi bob".to_string()),
        })
        .unwrap();

    let sent = wait_for(&mut alice_rx, |n| match n {
        Notification::Message { message, .. } => Some(message.clone()),
        _ => None,
    })
    .await;
    assert!(sent.is_mine);
    assert_eq!(sent.room, RoomRef::Direct(bob.public_key()));

    let received = wait_for(&mut bob_rx, |n| match n {
        Notification::Message { message, .. } => Some(message.clone()),
        _ => None,
    })
    .await;
    assert_eq!(received.content, "hi bob");
    assert_eq!(received.room, RoomRef::Direct(alice.public_key()));
    assert_eq!(received.event_id, sent.event_id);
    assert!(!received.is_mine);

    alice_handle.shutdown().unwrap();
    bob_handle.shutdown().unwrap();
    wait_for(&mut alice_rx, |n| matches!(n, Notification::ShutdownComplete).then_some(())).await;
    wait_for(&mut bob_rx, |n| matches!(n, Notification::ShutdownComplete).then_some(())).await;
}

#[tokio::test]
async fn created_channel_is_joinable_and_listed() {
    let relay = LocalRelay::new().await;
    let alice = Keys::generate();
    let bob = Keys::generate();

    let (alice_handle, mut alice_rx) = start(&alice, &relay);
    alice_handle
        .send(Command::CreateChannel(ChannelMetadata {
            name: "rust".to_string(),
            ..ChannelMetadata::default()
        }))
        .unwrap();
    let channel = wait_for(&mut alice_rx, |n| match n {
        Notification::RoomAdded(room @ RoomRef::Channel(_)) => Some(room.clone()),
        _ => None,
    })
    .await;

    let (bob_handle, mut bob_rx) = start(&bob, &relay);
    let RoomRef::Channel(id) = channel.clone() else {
        unreachable!()
    };
    bob_handle.send(Command::JoinChannel(id)).unwrap();
    let title = wait_for(&mut bob_rx, |n| match n {
        Notification::RoomTitle { room, title } if *room == channel => Some(title.clone()),
        _ => None,
    })
    .await;
    assert_eq!(title, "rust");

    alice_handle
        .send(Command::Send {
            room: channel.clone(),
            text: "hello channel".to_string(),
        })
        .unwrap();
    let message = wait_for(&mut bob_rx, |n| match n {
        Notification::Message { message, .. } if message.room == channel => Some(message.clone()),
        _ => None,
    })
    .await;
    assert_eq!(message.content, "hello channel");
    assert_eq!(message.pubkey, alice.public_key().to_hex());

    // Both joined lists were published
    common::eventually(|| {
        let lists = relay.events_of_kind(CHANNELS_LIST_KIND as u64).len();
        async move { lists >= 2 }
    })
    .await;

    alice_handle.shutdown().unwrap();
    bob_handle.shutdown().unwrap();
}

#[tokio::test]
async fn second_session_picks_up_published_list() {
    let relay = LocalRelay::new().await;
    let alice = Keys::generate();
    let channel = "cd".repeat(32);

    let (first, mut first_rx) = start(&alice, &relay);
    first.send(Command::JoinChannel(channel.clone())).unwrap();
    wait_for(&mut first_rx, |n| matches!(n, Notification::RoomAdded(_)).then_some(())).await;
    common::eventually(|| {
        let lists = relay.events_of_kind(CHANNELS_LIST_KIND as u64).len();
        async move { lists >= 1 }
    })
    .await;
    first.shutdown().unwrap();

    let (second, mut second_rx) = start(&alice, &relay);
    let added = wait_for(&mut second_rx, |n| match n {
        Notification::RoomAdded(room) => Some(room.clone()),
        _ => None,
    })
    .await;
    assert_eq!(added, RoomRef::Channel(channel));
    let entries = wait_for(&mut second_rx, |n| match n {
        Notification::ListApplied { entries, .. } => Some(*entries),
        _ => None,
    })
    .await;
    assert_eq!(entries, 1);
    second.shutdown().unwrap();
}
