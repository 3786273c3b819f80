//! Shared fixtures: a fake chat server speaking the duplex protocol and an
//! in-memory backend.
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use matchchat_core::backend::{ChatBackend, HistoryRecord};
use matchchat_core::error::{ChatError, Result};
use matchchat_core::types::{PresenceSnapshot, Profile, UserId};
use matchchat_core::Config;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub const WAIT: Duration = Duration::from_secs(5);
pub const TOKEN: &str = "header.payload.signature";

enum Command {
    Text(String),
    Close,
}

/// One accepted client connection, as seen by the server
pub struct ServerConn {
    /// The first frame the client wrote
    pub connect: Value,
    incoming: mpsc::UnboundedReceiver<Value>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ServerConn {
    pub fn push(&self, frame: Value) {
        let _ = self.commands.send(Command::Text(frame.to_string()));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.commands.send(Command::Text(text.to_string()));
    }

    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Next frame the client wrote, or None once the client went away
    pub async fn next_frame(&mut self) -> Option<Value> {
        timeout(WAIT, self.incoming.recv()).await.ok().flatten()
    }
}

/// WebSocket server on 127.0.0.1:0 handing each connection to the test
pub struct FakeChatServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConn>,
}

impl FakeChatServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else { return };
                    let (mut sink, mut stream) = ws.split();

                    let connect = match stream.next().await {
                        Some(Ok(WsMessage::Text(text))) => serde_json::from_str(&text).unwrap(),
                        _ => return,
                    };
                    let (incoming_tx, incoming) = mpsc::unbounded_channel();
                    let (commands, mut command_rx) = mpsc::unbounded_channel();
                    if tx.send(ServerConn { connect, incoming, commands }).is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            command = command_rx.recv() => match command {
                                Some(Command::Text(text)) => {
                                    if sink.send(WsMessage::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Command::Close) | None => {
                                    let _ = sink.send(WsMessage::Close(None)).await;
                                    break;
                                }
                            },
                            frame = stream.next() => match frame {
                                Some(Ok(WsMessage::Text(text))) => {
                                    if let Ok(value) = serde_json::from_str(&text) {
                                        let _ = incoming_tx.send(value);
                                    }
                                }
                                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => {}
                            },
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://{}/ws/chat", addr),
            connections,
        }
    }

    pub async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("no client connected in time")
            .expect("server stopped")
    }

    /// Like `accept`, but None when nobody connects within `wait`
    pub async fn try_accept(&mut self, wait: Duration) -> Option<ServerConn> {
        timeout(wait, self.connections.recv()).await.ok().flatten()
    }
}

/// In-memory roster, history and presence
#[derive(Default)]
pub struct FakeBackend {
    pub roster: Mutex<Vec<UserId>>,
    pub names: Mutex<HashMap<UserId, String>>,
    /// Newest first, as the server sends it
    pub history: Mutex<HashMap<UserId, Vec<HistoryRecord>>>,
    pub history_delay: Mutex<HashMap<UserId, Duration>>,
    /// Counterparts whose history endpoint errors
    pub history_failures: Mutex<HashSet<UserId>>,
    pub presence: Mutex<HashMap<UserId, bool>>,
    pub history_calls: AtomicU32,
}

impl FakeBackend {
    pub fn with_roster(roster: &[(i64, &str)]) -> Self {
        let backend = Self::default();
        for (id, name) in roster {
            backend.roster.lock().unwrap().push(UserId(*id));
            backend.names.lock().unwrap().insert(UserId(*id), name.to_string());
        }
        backend
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn fetch_connections(&self) -> Result<Vec<UserId>> {
        Ok(self.roster.lock().unwrap().clone())
    }

    async fn fetch_user_minimal(&self, id: UserId) -> Result<Profile> {
        let name = self.names.lock().unwrap().get(&id).cloned();
        match name {
            Some(name) => Ok(Profile { id, name }),
            None => Err(ChatError::Transport(format!("no profile for {}", id))),
        }
    }

    async fn fetch_history(&self, counterpart: UserId, page: u32) -> Result<Vec<HistoryRecord>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.history_delay.lock().unwrap().get(&counterpart).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.history_failures.lock().unwrap().contains(&counterpart) {
            return Err(ChatError::Transport("history unavailable".to_string()));
        }
        if page > 1 {
            return Ok(Vec::new());
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&counterpart)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_presence(&self) -> Result<PresenceSnapshot> {
        Ok(PresenceSnapshot(self.presence.lock().unwrap().clone()))
    }
}

pub fn config(user_id: i64, ws_url: &str) -> Config {
    Config {
        user_id: UserId(user_id),
        ws_url: ws_url.to_string(),
        token: Some(TOKEN.to_string()),
        presence_interval: Duration::from_millis(50),
        reconnect_base: Duration::from_millis(20),
        reconnect_cap: Duration::from_millis(80),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Poll `check` until it holds or the wait runs out
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
