use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

type Events = Arc<Mutex<Vec<Value>>>;

struct Client {
    tx: mpsc::UnboundedSender<Message>,
    subscriptions: HashMap<String, Vec<Value>>,
}

type Clients = Arc<Mutex<HashMap<SocketAddr, Client>>>;

/// Minimal in-process relay: stores every event, answers REQ with stored
/// matches plus EOSE, fans new events out to matching subscriptions.
pub struct LocalRelay {
    events: Events,
    clients: Clients,
    addr: SocketAddr,
}

impl LocalRelay {
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let clients: Clients = Arc::new(Mutex::new(HashMap::new()));

        let events_clone = events.clone();
        let clients_clone = clients.clone();
        tokio::spawn(async move {
            Self::run_server(listener, events_clone, clients_clone).await;
        });

        LocalRelay {
            events,
            clients,
            addr,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.addr.port())
    }

    pub fn events(&self) -> Vec<Value> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_of_kind(&self, kind: u64) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|e| e["kind"].as_u64() == Some(kind))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .values()
            .map(|c| c.subscriptions.len())
            .sum()
    }

    /// Send CLOSED for every open subscription and forget them.
    pub fn close_all_subscriptions(&self, reason: &str) {
        let mut clients = self.clients.lock().unwrap();
        for client in clients.values_mut() {
            for (sub_id, _) in client.subscriptions.drain() {
                let closed = json!(["CLOSED", sub_id, reason]);
                let _ = client.tx.send(Message::Text(closed.to_string()));
            }
        }
    }

    async fn run_server(listener: TcpListener, events: Events, clients: Clients) {
        while let Ok((stream, addr)) = listener.accept().await {
            let evs = events.clone();
            let cls = clients.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, evs, cls.clone()).await {
                    eprintln!("local relay error: {}", e);
                }
                cls.lock().unwrap().remove(&addr);
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        events: Events,
        clients: Clients,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        clients.lock().unwrap().insert(
            addr,
            Client {
                tx: tx.clone(),
                subscriptions: HashMap::new(),
            },
        );

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = ws_receiver.next().await {
            let Message::Text(text) = msg? else {
                continue;
            };
            let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            match arr.first().and_then(|v| v.as_str()).unwrap_or("") {
                "REQ" if arr.len() >= 3 => {
                    let sub_id = arr[1].as_str().unwrap_or("").to_string();
                    let filters = arr[2..].to_vec();

                    let stored = events.lock().unwrap().clone();
                    for event in stored.iter().filter(|e| matches_any(e, &filters)) {
                        let _ = tx.send(Message::Text(json!(["EVENT", sub_id, event]).to_string()));
                    }
                    let _ = tx.send(Message::Text(json!(["EOSE", sub_id]).to_string()));

                    if let Some(client) = clients.lock().unwrap().get_mut(&addr) {
                        client.subscriptions.insert(sub_id, filters);
                    }
                }
                "EVENT" if arr.len() >= 2 => {
                    let event = arr[1].clone();
                    let event_id = event["id"].as_str().unwrap_or("").to_string();
                    events.lock().unwrap().push(event.clone());
                    let _ = tx.send(Message::Text(json!(["OK", event_id, true, ""]).to_string()));

                    let all = clients.lock().unwrap();
                    for client in all.values() {
                        for (sub_id, filters) in &client.subscriptions {
                            if matches_any(&event, filters) {
                                let msg = json!(["EVENT", sub_id, event]);
                                let _ = client.tx.send(Message::Text(msg.to_string()));
                            }
                        }
                    }
                }
                "CLOSE" if arr.len() >= 2 => {
                    let sub_id = arr[1].as_str().unwrap_or("");
                    if let Some(client) = clients.lock().unwrap().get_mut(&addr) {
                        client.subscriptions.remove(sub_id);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn matches_any(event: &Value, filters: &[Value]) -> bool {
    filters.iter().any(|f| matches_filter(event, f))
}

fn matches_filter(event: &Value, filter: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return false;
    };
    for (key, wanted) in filter {
        let ok = match key.as_str() {
            "ids" => contains_str(wanted, event["id"].as_str()),
            "authors" => contains_str(wanted, event["pubkey"].as_str()),
            "kinds" => wanted
                .as_array()
                .is_some_and(|kinds| kinds.iter().any(|k| k.as_u64() == event["kind"].as_u64())),
            "since" => event["created_at"].as_u64() >= wanted.as_u64(),
            "until" => event["created_at"].as_u64() <= wanted.as_u64(),
            tag if tag.starts_with('#') => {
                let name = &tag[1..];
                event["tags"].as_array().is_some_and(|tags| {
                    tags.iter().any(|t| {
                        t[0].as_str() == Some(name) && contains_str(wanted, t[1].as_str())
                    })
                })
            }
            _ => true,
        };
        if !ok {
            return false;
        }
    }
    true
}

fn contains_str(list: &Value, value: Option<&str>) -> bool {
    let Some(value) = value else {
        return false;
    };
    list.as_array()
        .is_some_and(|items| items.iter().any(|i| i.as_str() == Some(value)))
}
