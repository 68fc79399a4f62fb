//! Async driver around [`ChatCore`]: feeds it commands and task results and
//! carries out the effects it emits.

use crate::chat::ChatCore;
use crate::events::{Command, CoreEffect, Notification, PublishTarget, TaskEvent};
use crate::identifier::resolve_identifier;
use crate::lists::ListKind;
use crate::relay::{spawn_inbox_stream, spawn_room_stream, RelayPool};
use crate::storage::ConversationLog;
use crate::types::ChatConfig;
use crate::{Error, Result};
use nostr::Keys;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Sending side for UI commands. Cheap to clone.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChatHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Relay("chat runtime stopped".to_string()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

enum Flow {
    Continue,
    Exit,
}

pub struct Runtime {
    core: ChatCore,
    effects: crossbeam_channel::Receiver<CoreEffect>,
    pool: Arc<RelayPool>,
    keys: Keys,
    http: reqwest::Client,
    tasks_tx: mpsc::UnboundedSender<TaskEvent>,
    tasks_rx: mpsc::UnboundedReceiver<TaskEvent>,
    streams: HashMap<String, oneshot::Sender<()>>,
    commands: mpsc::UnboundedReceiver<Command>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl Runtime {
    /// Build a runtime plus the handle for feeding it and the receiver for its notifications.
    pub fn new(
        keys: Keys,
        config: ChatConfig,
        log: Arc<dyn ConversationLog>,
    ) -> (Self, ChatHandle, mpsc::UnboundedReceiver<Notification>) {
        let (effects_tx, effects_rx) = crossbeam_channel::unbounded();
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(RelayPool::new(keys.clone(), config.relays.clone()));
        let core = ChatCore::new(keys.clone(), config, log, effects_tx);

        let runtime = Self {
            core,
            effects: effects_rx,
            pool,
            keys,
            http: reqwest::Client::new(),
            tasks_tx,
            tasks_rx,
            streams: HashMap::new(),
            commands: commands_rx,
            notifications: notify_tx,
        };
        (runtime, ChatHandle { commands: commands_tx }, notify_rx)
    }

    pub fn pool(&self) -> Arc<RelayPool> {
        self.pool.clone()
    }

    /// Run until a shutdown completes or every handle is dropped.
    pub async fn run(mut self) {
        self.core.start();
        if let Flow::Exit = self.drain_effects().await {
            return;
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.core.handle_command(command),
                    None => {
                        tracing::debug!("all handles dropped, shutting down");
                        self.core.handle_command(Command::Shutdown);
                    }
                },
                Some(event) = self.tasks_rx.recv() => self.core.process_task_event(event),
            }
            if let Flow::Exit = self.drain_effects().await {
                return;
            }
        }
    }

    async fn drain_effects(&mut self) -> Flow {
        while let Ok(effect) = self.effects.try_recv() {
            if let Flow::Exit = self.apply(effect).await {
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    async fn apply(&mut self, effect: CoreEffect) -> Flow {
        match effect {
            CoreEffect::Notify(notification) => self.notify(notification),
            CoreEffect::Subscribe {
                key,
                generation,
                room,
            } => {
                let cancel = spawn_room_stream(
                    self.pool.clone(),
                    key.clone(),
                    generation,
                    room,
                    self.tasks_tx.clone(),
                );
                self.replace_stream(key, cancel);
            }
            CoreEffect::SubscribeInbox { generation, since } => {
                let cancel = spawn_inbox_stream(
                    self.pool.clone(),
                    self.keys.clone(),
                    generation,
                    since,
                    self.tasks_tx.clone(),
                );
                self.replace_stream(crate::subscription::INBOX_KEY.to_string(), cancel);
            }
            CoreEffect::Unsubscribe { key } => {
                if let Some(cancel) = self.streams.remove(&key) {
                    let _ = cancel.send(());
                }
            }
            CoreEffect::ScheduleReconnect {
                key,
                generation,
                delay,
            } => {
                let tx = self.tasks_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(TaskEvent::ReconnectDue { key, generation });
                });
            }
            CoreEffect::Publish {
                event,
                target,
                label,
                room,
            } => {
                let pool = self.pool.clone();
                let tx = self.tasks_tx.clone();
                tokio::spawn(async move {
                    let relays = match target {
                        PublishTarget::Configured => pool.configured_relays().to_vec(),
                        PublishTarget::Relay(url) => vec![url],
                    };
                    let report = pool.publish(&event, &relays).await;
                    tracing::debug!(%label, event = %event.id, ok = report.success.len(), "published");
                    let _ = tx.send(TaskEvent::PublishFinished {
                        label,
                        room,
                        report,
                    });
                });
            }
            CoreEffect::PublishDirect {
                wrapped,
                recipient,
                room,
            } => {
                let pool = self.pool.clone();
                let tx = self.tasks_tx.clone();
                tokio::spawn(async move {
                    let result = pool
                        .publish_direct(&wrapped, &recipient)
                        .await
                        .map_err(|e| e.to_string());
                    let _ = tx.send(TaskEvent::DirectPublishFinished { room, result });
                });
            }
            CoreEffect::FetchLists => {
                for list in ListKind::ALL {
                    let pool = self.pool.clone();
                    let keys = self.keys.clone();
                    let tx = self.tasks_tx.clone();
                    tokio::spawn(async move {
                        let event = match pool.fetch_list(&keys, list).await {
                            Ok(Some(list)) => TaskEvent::ListFetched(list),
                            Ok(None) => {
                                tracing::debug!(list = list.as_str(), "no list published yet");
                                TaskEvent::ListMissing(list)
                            }
                            Err(e) => TaskEvent::ListFetchFailed {
                                list,
                                reason: e.to_string(),
                            },
                        };
                        let _ = tx.send(event);
                    });
                }
            }
            CoreEffect::FetchProfiles(pubkeys) => {
                let pool = self.pool.clone();
                let tx = self.tasks_tx.clone();
                tokio::spawn(async move {
                    match pool.fetch_profiles(&pubkeys).await {
                        Ok(profiles) => {
                            for (pubkey, profile) in profiles {
                                let _ = tx.send(TaskEvent::ProfileFetched { pubkey, profile });
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "profile fetch failed"),
                    }
                });
            }
            CoreEffect::Resolve { input, purpose } => {
                let http = self.http.clone();
                let tx = self.tasks_tx.clone();
                tokio::spawn(async move {
                    let result = resolve_identifier(&http, &input)
                        .await
                        .map(|resolved| resolved.pubkey)
                        .map_err(|e| e.to_string());
                    let _ = tx.send(TaskEvent::Resolved {
                        input,
                        purpose,
                        result,
                    });
                });
            }
            CoreEffect::Shutdown => {
                for (_, cancel) in self.streams.drain() {
                    let _ = cancel.send(());
                }
                self.pool.shutdown().await;
                self.notify(Notification::ShutdownComplete);
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn replace_stream(&mut self, key: String, cancel: oneshot::Sender<()>) {
        if let Some(previous) = self.streams.insert(key, cancel) {
            let _ = previous.send(());
        }
    }

    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            tracing::debug!("notification receiver dropped");
        }
    }
}
