use nostr_chat::{ChatMessage, RoomSummary};
use serde::Serialize;

/// Output formatter that supports both human-readable and JSON output
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Output a successful result
    pub fn success<T: Serialize>(&self, command: &str, data: T) {
        if self.json {
            let response = JsonResponse {
                status: "ok",
                command,
                data: Some(data),
                error: None::<String>,
            };
            println!("{}", to_json(&response));
        } else {
            println!("{}", to_pretty_json(&data));
        }
    }

    /// Output a simple success message
    pub fn success_message(&self, command: &str, message: &str) {
        if self.json {
            let response = JsonResponse {
                status: "ok",
                command,
                data: Some(serde_json::json!({ "message": message })),
                error: None::<String>,
            };
            println!("{}", to_json(&response));
        } else {
            println!("{}", message);
        }
    }

    /// Output an error
    pub fn error(&self, message: &str) {
        if self.json {
            let response: JsonResponse<()> = JsonResponse {
                status: "error",
                command: "",
                data: None,
                error: Some(message.to_string()),
            };
            eprintln!("{}", to_json(&response));
        } else {
            eprintln!("Error: {}", message);
        }
    }

    /// Output a streaming event (interactive chat)
    pub fn event<T: Serialize>(&self, event_type: &str, data: T) {
        if self.json {
            let event = StreamEvent {
                event: event_type,
                data,
            };
            println!("{}", to_json(&event));
        } else {
            println!("[{}] {}", event_type, to_json(&data));
        }
    }

    /// One chat line
    pub fn message(&self, message: &ChatMessage, room_title: &str, active: bool) {
        if self.json {
            self.event("message", message);
        } else {
            println!("{}", format_message_line(message, room_title, active));
        }
    }

    pub fn rooms(&self, rooms: &[RoomSummary]) {
        if self.json {
            self.event("rooms", serde_json::json!({ "rooms": rooms_json(rooms) }));
            return;
        }
        if rooms.is_empty() {
            println!("(no rooms, try /join)");
        }
        for (i, room) in rooms.iter().enumerate() {
            println!("{}", format_room_line(i + 1, room));
        }
    }

    pub fn notice(&self, text: &str) {
        if self.json {
            self.event("status", serde_json::json!({ "text": text }));
        } else {
            println!("-- {}", text);
        }
    }
}

pub fn format_message_line(message: &ChatMessage, room_title: &str, active: bool) -> String {
    let time = chrono::DateTime::from_timestamp(message.timestamp as i64, 0)
        .map(|dt| dt.with_timezone(&chrono::Local).format("%H:%M").to_string())
        .unwrap_or_default();
    let author = if message.is_mine { "me" } else { message.author.as_str() };
    if active {
        format!("{} <{}> {}", time, author, message.content)
    } else {
        format!("{} [{}] <{}> {}", time, room_title, author, message.content)
    }
}

pub fn format_room_line(index: usize, room: &RoomSummary) -> String {
    let marker = if room.active { "*" } else { " " };
    let unread = if room.unread > 0 {
        format!(" ({} unread)", room.unread)
    } else {
        String::new()
    };
    format!(
        "{}{:>2}. {}{}{}",
        marker,
        index,
        room.room.display_prefix(),
        room.title,
        unread
    )
}

fn rooms_json(rooms: &[RoomSummary]) -> Vec<serde_json::Value> {
    rooms
        .iter()
        .map(|r| {
            serde_json::json!({
                "room": r.room,
                "title": r.title,
                "unread": r.unread,
                "active": r.active,
            })
        })
        .collect()
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn to_pretty_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[derive(Serialize)]
struct JsonResponse<'a, T: Serialize> {
    status: &'a str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct StreamEvent<'a, T: Serialize> {
    event: &'a str,
    #[serde(flatten)]
    data: T,
}
