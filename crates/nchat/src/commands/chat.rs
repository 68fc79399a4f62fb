//! Interactive chat session over [`nostr_chat::Runtime`].

use anyhow::Result;
use nostr::ToBech32;
use nostr_chat::identifier::{parse_identifier, Identifier};
use nostr_chat::{
    ChannelMetadata, Command, FileConversationLog, GroupKey, GroupMetadataFields, Notification,
    ProfileFields, RoomRef, RoomSummary, Runtime,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::room::{parse_room_target, resolve_room_offline, RoomTarget};
use crate::config::{normalize_relay, Config};
use crate::output::Output;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const HELP: &str = "\
/join <#channel|relay'group|person> [invite-code]
/msg <person> <text>
/leave [room|n]        /switch <room|n>      /rooms
/create-channel <name> [about]
/create-group <relay[']id]> [name]
/group-meta name=.. about=.. picture=.. public|private open|closed
/invite [code]         /add-user <pubkey> [role]     /delete <event-id>
/name <name>           /whois <identifier>
/help                  /quit
Plain text goes to the active room; start a line with // to send a literal /.";

/// What one line of user input asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(Command),
    Help,
    Quit,
    Nothing,
}

/// The client-side picture of rooms, rebuilt from notifications.
#[derive(Debug, Default)]
pub struct ChatView {
    rooms: Vec<RoomSummary>,
    active: Option<RoomRef>,
    show_rooms: bool,
}

impl ChatView {
    fn title(&self, room: &RoomRef) -> String {
        self.rooms
            .iter()
            .find(|r| &r.room == room)
            .map(|r| format!("{}{}", room.display_prefix(), r.title))
            .unwrap_or_else(|| room.to_string())
    }

    /// 1-based index into the last room listing, or a room reference.
    fn room_arg(&self, arg: &str) -> Result<Option<RoomRef>, String> {
        if let Ok(n) = arg.parse::<usize>() {
            return self
                .rooms
                .get(n.wrapping_sub(1))
                .map(|r| Some(r.room.clone()))
                .ok_or_else(|| format!("No room #{}", n));
        }
        let target = parse_room_target(arg).map_err(|e| e.to_string())?;
        resolve_room_offline(&target).map_err(|e| e.to_string())
    }

    fn active_group(&self) -> Result<GroupKey, String> {
        match &self.active {
            Some(RoomRef::Group(group)) => Ok(group.clone()),
            _ => Err("The active room is not a group".to_string()),
        }
    }

    /// Update the view and print the notification. Returns `true` once shutdown completed.
    fn apply(&mut self, notification: Notification, output: &Output) -> bool {
        match notification {
            Notification::Rooms(rooms) => {
                self.active = rooms.iter().find(|r| r.active).map(|r| r.room.clone());
                self.rooms = rooms;
                if std::mem::take(&mut self.show_rooms) {
                    output.rooms(&self.rooms);
                }
            }
            Notification::Activated { room, history } => {
                let title = self.title(&room);
                self.active = Some(room);
                output.notice(&format!("now talking in {}", title));
                for message in &history {
                    output.message(message, &title, true);
                }
            }
            Notification::Message { message, active, .. } => {
                let title = self.title(&message.room);
                output.message(&message, &title, active);
            }
            Notification::RoomAdded(room) => output.notice(&format!("joined {}", room)),
            Notification::RoomRemoved(room) => {
                if self.active.as_ref() == Some(&room) {
                    self.active = None;
                }
                output.notice(&format!("left {}", self.title(&room)));
            }
            Notification::RoomTitle { room, title } => {
                if let Some(summary) = self.rooms.iter_mut().find(|r| r.room == room) {
                    summary.title = title;
                }
            }
            Notification::DisplayName { pubkey, name } => {
                if output.is_json() {
                    output.event(
                        "display_name",
                        serde_json::json!({ "pubkey": pubkey.to_hex(), "name": name }),
                    );
                }
            }
            Notification::Resolved { input, pubkey } => output.notice(&format!(
                "{} is {}",
                input,
                pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex())
            )),
            Notification::ListApplied { list, entries, .. } => output.notice(&format!(
                "{} list synced ({} entries)",
                list.as_str(),
                entries
            )),
            Notification::Status { text, .. } => output.notice(&text),
            Notification::Error { text, .. } => output.error(&text),
            Notification::ShutdownComplete => return true,
        }
        false
    }
}

/// Parse one line typed into the session.
pub fn parse_input(line: &str, view: &ChatView) -> Result<Input, String> {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return Ok(Input::Nothing);
    }

    let text = if let Some(literal) = line.strip_prefix("//") {
        Some(format!("/{}", literal))
    } else if !line.starts_with('/') {
        Some(line.to_string())
    } else {
        None
    };
    if let Some(text) = text {
        let room = view
            .active
            .clone()
            .ok_or("No active room; /join one first")?;
        return Ok(Input::Command(Command::Send { room, text }));
    }

    let (name, rest) = match line[1..].split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (&line[1..], ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let command = match name {
        "help" | "h" | "?" => return Ok(Input::Help),
        "quit" | "exit" | "q" => return Ok(Input::Quit),
        "rooms" => Command::ListRooms,
        "join" | "j" => {
            let target = args.first().ok_or("Usage: /join <room> [invite-code]")?;
            match parse_room_target(target).map_err(|e| e.to_string())? {
                RoomTarget::Channel(id) => Command::JoinChannel(id),
                RoomTarget::Group(group) => Command::JoinGroup {
                    group,
                    invite_code: args.get(1).map(|c| c.to_string()),
                },
                RoomTarget::Person(identifier) => Command::OpenDirect {
                    identifier,
                    text: None,
                },
            }
        }
        "msg" | "m" => {
            let (who, text) = rest
                .split_once(char::is_whitespace)
                .ok_or("Usage: /msg <person> <text>")?;
            Command::OpenDirect {
                identifier: who.trim_start_matches('@').to_string(),
                text: Some(text.trim().to_string()),
            }
        }
        "leave" | "part" => {
            let room = match args.first() {
                Some(arg) => view.room_arg(arg)?,
                None => view.active.clone(),
            };
            Command::Leave(room.ok_or("Nothing to leave")?)
        }
        "switch" | "s" => {
            let arg = args.first().ok_or("Usage: /switch <room|n>")?;
            match view.room_arg(arg)? {
                Some(room) => Command::Activate(room),
                None => Command::OpenDirect {
                    identifier: arg.trim_start_matches('@').to_string(),
                    text: None,
                },
            }
        }
        "create-channel" => {
            let (name, about) = match rest.split_once(char::is_whitespace) {
                Some((name, about)) => (name, Some(about.trim().to_string())),
                None => (rest, None),
            };
            if name.is_empty() {
                return Err("Usage: /create-channel <name> [about]".to_string());
            }
            Command::CreateChannel(ChannelMetadata {
                name: name.to_string(),
                about,
                picture: None,
            })
        }
        "create-group" => {
            let (target, name) = match rest.split_once(char::is_whitespace) {
                Some((target, name)) => (target, Some(name.trim().to_string())),
                None => (rest, None),
            };
            if target.is_empty() {
                return Err("Usage: /create-group <relay[']id]> [name]".to_string());
            }
            let (relay, group_id) = match target.rsplit_once('\'') {
                Some((relay, id)) if !id.is_empty() => (relay, Some(id.to_string())),
                Some((relay, _)) => (relay, None),
                None => (target, None),
            };
            Command::CreateGroup {
                relay_url: normalize_relay(relay).map_err(|e| e.to_string())?,
                group_id,
                metadata: GroupMetadataFields {
                    name,
                    ..Default::default()
                },
            }
        }
        "group-meta" => {
            let group = view.active_group()?;
            let fields = parse_group_fields(&args)?;
            if fields == GroupMetadataFields::default() {
                return Err("Nothing to change".to_string());
            }
            Command::EditGroupMetadata { group, fields }
        }
        "invite" => Command::CreateInvite {
            group: view.active_group()?,
            code: args.first().map(|c| c.to_string()),
        },
        "add-user" => {
            let group = view.active_group()?;
            let who = args.first().ok_or("Usage: /add-user <pubkey> [role]")?;
            let pubkey = match parse_identifier(who.trim_start_matches('@')) {
                Ok(Identifier::PublicKey { pubkey, .. }) => pubkey,
                _ => return Err(format!("Not a public key: {}", who)),
            };
            Command::PutUser {
                group,
                pubkey,
                role: args.get(1).map(|r| r.to_string()),
            }
        }
        "delete" => {
            let group = view.active_group()?;
            let event_id = args.first().ok_or("Usage: /delete <event-id>")?;
            Command::DeleteEvent {
                group,
                event_id: event_id.to_string(),
            }
        }
        "name" | "nick" => {
            if rest.is_empty() {
                return Err("Usage: /name <name>".to_string());
            }
            Command::SetProfile(ProfileFields {
                name: Some(rest.to_string()),
                ..Default::default()
            })
        }
        "whois" => {
            let who = args.first().ok_or("Usage: /whois <identifier>")?;
            Command::Resolve(who.trim_start_matches('@').to_string())
        }
        other => return Err(format!("Unknown command /{}; try /help", other)),
    };
    Ok(Input::Command(command))
}

fn parse_group_fields(args: &[&str]) -> Result<GroupMetadataFields, String> {
    let mut fields = GroupMetadataFields::default();
    for arg in args {
        match *arg {
            "public" => fields.public = Some(true),
            "private" => fields.public = Some(false),
            "open" => fields.open = Some(true),
            "closed" => fields.open = Some(false),
            _ => {
                let (key, value) = arg
                    .split_once('=')
                    .ok_or_else(|| format!("Expected key=value, got {}", arg))?;
                let value = Some(value.to_string());
                match key {
                    "name" => fields.name = value,
                    "about" => fields.about = value,
                    "picture" => fields.picture = value,
                    _ => return Err(format!("Unknown group field {}", key)),
                }
            }
        }
    }
    Ok(fields)
}

/// Run the interactive session until /quit or end of input
pub async fn run(config: &Config, data_dir: &Path, output: &Output) -> Result<()> {
    let keys = config.keys()?;
    let log = Arc::new(FileConversationLog::new(crate::logs_dir(data_dir))?);
    let (runtime, handle, mut notifications) = Runtime::new(keys, config.chat_config(), log);
    let driver = tokio::spawn(runtime.run());

    if !output.is_json() {
        println!("nchat: type /help for commands");
    }

    let mut view = ChatView::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut finished = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line, &view) {
                    Ok(Input::Command(command)) => {
                        if matches!(command, Command::ListRooms) {
                            view.show_rooms = true;
                        }
                        handle.send(command)?;
                    }
                    Ok(Input::Help) => println!("{}", HELP),
                    Ok(Input::Quit) => break,
                    Ok(Input::Nothing) => {}
                    Err(e) => output.error(&e),
                }
            }
            notification = notifications.recv() => match notification {
                Some(notification) => {
                    if view.apply(notification, output) {
                        finished = true;
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if !finished {
        handle.shutdown()?;
        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while let Some(notification) = notifications.recv().await {
                if view.apply(notification, output) {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("shutdown did not complete in time");
        }
    }
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, driver).await.is_err() {
        tracing::warn!("chat runtime still running at exit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_with(rooms: Vec<RoomRef>, active: Option<usize>) -> ChatView {
        ChatView {
            rooms: rooms
                .iter()
                .enumerate()
                .map(|(i, room)| RoomSummary {
                    room: room.clone(),
                    title: format!("room{}", i),
                    unread: 0,
                    active: Some(i) == active,
                })
                .collect(),
            active: active.map(|i| rooms[i].clone()),
            show_rooms: false,
        }
    }

    fn group() -> RoomRef {
        RoomRef::Group(GroupKey::new("wss://groups.example.com", "pizza"))
    }

    #[test]
    fn test_plain_text_goes_to_active_room() {
        let view = view_with(vec![group()], Some(0));
        assert_eq!(
            parse_input("hello there", &view).unwrap(),
            Input::Command(Command::Send {
                room: group(),
                text: "hello there".to_string()
            })
        );
        assert_eq!(
            parse_input("//shrug", &view).unwrap(),
            Input::Command(Command::Send {
                room: group(),
                text: "/shrug".to_string()
            })
        );
        assert_eq!(parse_input("   ", &view).unwrap(), Input::Nothing);
    }

    #[test]
    fn test_text_without_active_room_is_rejected() {
        assert!(parse_input("hello", &ChatView::default()).is_err());
    }

    #[test]
    fn test_join_forms() {
        let view = ChatView::default();
        let channel = "ab".repeat(32);
        assert_eq!(
            parse_input(&format!("/join #{}", channel), &view).unwrap(),
            Input::Command(Command::JoinChannel(channel))
        );
        assert_eq!(
            parse_input("/join groups.example.com'pizza s3cret", &view).unwrap(),
            Input::Command(Command::JoinGroup {
                group: GroupKey::new("wss://groups.example.com", "pizza"),
                invite_code: Some("s3cret".to_string()),
            })
        );
        assert_eq!(
            parse_input("/join bob@example.com", &view).unwrap(),
            Input::Command(Command::OpenDirect {
                identifier: "bob@example.com".to_string(),
                text: None,
            })
        );
        assert!(parse_input("/join", &view).is_err());
    }

    #[test]
    fn test_msg_keeps_whole_text() {
        assert_eq!(
            parse_input("/msg @bob@example.com see you  at 8", &ChatView::default()).unwrap(),
            Input::Command(Command::OpenDirect {
                identifier: "bob@example.com".to_string(),
                text: Some("see you  at 8".to_string()),
            })
        );
    }

    #[test]
    fn test_switch_and_leave_by_index() {
        let channel = RoomRef::Channel("cd".repeat(32));
        let view = view_with(vec![channel.clone(), group()], Some(0));
        assert_eq!(
            parse_input("/switch 2", &view).unwrap(),
            Input::Command(Command::Activate(group()))
        );
        assert_eq!(
            parse_input("/leave", &view).unwrap(),
            Input::Command(Command::Leave(channel))
        );
        assert!(parse_input("/switch 3", &view).is_err());
        assert!(parse_input("/switch 0", &view).is_err());
    }

    #[test]
    fn test_group_admin_commands_need_active_group() {
        let channel = RoomRef::Channel("cd".repeat(32));
        let in_channel = view_with(vec![channel], Some(0));
        assert!(parse_input("/invite", &in_channel).is_err());

        let in_group = view_with(vec![group()], Some(0));
        let Input::Command(Command::EditGroupMetadata { fields, .. }) =
            parse_input("/group-meta name=Pizza private open", &in_group).unwrap()
        else {
            panic!("expected metadata edit");
        };
        assert_eq!(fields.name.as_deref(), Some("Pizza"));
        assert_eq!(fields.public, Some(false));
        assert_eq!(fields.open, Some(true));
        assert!(parse_input("/group-meta colour=red", &in_group).is_err());
        assert!(parse_input("/add-user not-a-key", &in_group).is_err());
    }

    #[test]
    fn test_create_group_splits_relay_and_id() {
        assert_eq!(
            parse_input("/create-group groups.example.com'pizza Pizza Club", &ChatView::default())
                .unwrap(),
            Input::Command(Command::CreateGroup {
                relay_url: "wss://groups.example.com".to_string(),
                group_id: Some("pizza".to_string()),
                metadata: GroupMetadataFields {
                    name: Some("Pizza Club".to_string()),
                    ..Default::default()
                },
            })
        );
    }

    #[test]
    fn test_unknown_command() {
        assert!(parse_input("/frobnicate", &ChatView::default()).is_err());
        assert_eq!(parse_input("/quit", &ChatView::default()).unwrap(), Input::Quit);
    }

    #[test]
    fn test_view_tracks_active_room_from_notifications() {
        let mut view = ChatView::default();
        let output = Output::new(true);
        view.apply(Notification::Rooms(view_with(vec![group()], Some(0)).rooms), &output);
        assert_eq!(view.active, Some(group()));
        view.apply(Notification::RoomRemoved(group()), &output);
        assert_eq!(view.active, None);
        assert!(view.apply(Notification::ShutdownComplete, &output));
    }
}
