/// Chat session controller: wires the supervisor, poller, loader and store
/// together and exposes the view-model to the presentation layer.
use crate::auth::{AuthToken, Credentials};
use crate::backend::{load_roster, ChatBackend};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::events::{ConnectionEvent, SessionEvent};
use crate::history::HistoryLoader;
use crate::presence::{PresenceHandle, PresencePoller, PresenceReading};
use crate::store::{ConversationStore, Ingest, TranscriptEntry};
use crate::transport::{ConnectionState, ConnectionSupervisor};
use crate::types::{LocalId, Message, Profile, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One row of the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationRow {
    pub counterpart: UserId,
    pub name: String,
    pub online: bool,
    pub unread: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub preview: Option<String>,
}

/// Everything the chat view renders
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatView {
    pub conversations: Vec<ConversationRow>,
    pub active: Option<UserId>,
    pub transcript: Vec<TranscriptEntry>,
    pub connection: ConnectionState,
    pub presence_stale: bool,
}

/// State reachable from background tasks
struct Shared {
    me: UserId,
    store: RwLock<ConversationStore>,
    profiles: RwLock<Vec<Profile>>,
    /// Next history page to request per conversation
    next_pages: RwLock<HashMap<UserId, u32>>,
    history: HistoryLoader,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn apply(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(message) => {
                let outcome = self.store.write().await.ingest_live(message);
                match outcome {
                    Ingest::Inserted { counterpart, unread } => {
                        self.emit(SessionEvent::TranscriptChanged { counterpart });
                        if let Some(count) = unread {
                            self.emit(SessionEvent::UnreadChanged { counterpart, count });
                        }
                    }
                    Ingest::Duplicate { counterpart } => {
                        debug!("Duplicate message in conversation with {}", counterpart);
                        self.emit(SessionEvent::TranscriptChanged { counterpart });
                    }
                    Ingest::Foreign => {}
                }
            }
            ConnectionEvent::DeliveryAck(Some(local_id)) => {
                match self.store.write().await.acknowledge(local_id) {
                    Some(counterpart) => self.emit(SessionEvent::TranscriptChanged { counterpart }),
                    None => debug!("Delivery ack for unknown or settled send {}", local_id),
                }
            }
            // The server only acks sends to online receivers and names none of
            // them, so an id-less ack cannot be tied to an entry
            ConnectionEvent::DeliveryAck(None) => debug!("Delivery notice without local id"),
            ConnectionEvent::TypingIndicator(counterpart) => {
                self.emit(SessionEvent::Typing { counterpart });
            }
            ConnectionEvent::ConnectionStateChanged(state) => {
                self.emit(SessionEvent::ConnectionStateChanged { state });
            }
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                self.emit(SessionEvent::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
        }
    }

    /// Fetch one history page and merge it. Focus and unread counts are untouched,
    /// so a result for a conversation the user already left is harmless.
    async fn load_history(&self, counterpart: UserId, page: u32) -> Result<usize> {
        let batch = self.history.load_page(counterpart, page).await?;
        let inserted = self.store.write().await.ingest_history(&batch);

        if !batch.messages.is_empty() {
            let mut pages = self.next_pages.write().await;
            let next = pages.entry(counterpart).or_insert(1);
            *next = (*next).max(page + 1);
        }
        if inserted > 0 {
            self.emit(SessionEvent::TranscriptChanged { counterpart });
        }
        Ok(inserted)
    }
}

pub struct ChatSession {
    shared: Arc<Shared>,
    backend: Arc<dyn ChatBackend>,
    supervisor: ConnectionSupervisor,
    presence: PresenceHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatSession {
    /// Connect, start presence polling, load the roster and select the most
    /// recent conversation.
    pub async fn start(config: Config, backend: Arc<dyn ChatBackend>) -> Result<Self> {
        config.validate()?;
        let raw_token = config
            .token
            .as_deref()
            .ok_or_else(|| ChatError::InvalidToken("missing token".to_string()))?;
        let token = AuthToken::parse(raw_token)?;
        let me = config.user_id;

        let (events, _) = broadcast::channel(config.event_capacity);
        let shared = Arc::new(Shared {
            me,
            store: RwLock::new(ConversationStore::new(me, config.dedup_tolerance)),
            profiles: RwLock::new(Vec::new()),
            next_pages: RwLock::new(HashMap::new()),
            history: HistoryLoader::new(me, backend.clone()),
            events,
        });

        let supervisor = ConnectionSupervisor::from_config(&config);
        let connection_events = supervisor.open(Credentials::new(me, token)).await?;
        let pump = tokio::spawn(pump_connection_events(connection_events, shared.clone()));

        let presence = PresencePoller::new(backend.clone()).start(config.presence_interval);
        let forward = tokio::spawn(forward_presence(presence.subscribe(), shared.clone()));

        let session = Self {
            shared,
            backend,
            supervisor,
            presence,
            tasks: Mutex::new(vec![pump, forward]),
        };

        session.reload_roster().await;
        let most_recent = session
            .shared
            .store
            .read()
            .await
            .conversations()
            .first()
            .map(|c| c.counterpart);
        if let Some(counterpart) = most_recent {
            if session.active().await.is_none() {
                session.select(counterpart).await;
            }
        }

        info!("Chat session started for user {}", me);
        Ok(session)
    }

    pub fn me(&self) -> UserId {
        self.shared.me
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Activate a conversation, clear its badge and load its history in the
    /// background. The returned receiver fires once the load has been merged
    /// (or has failed).
    pub async fn select(&self, counterpart: UserId) -> oneshot::Receiver<()> {
        self.shared.store.write().await.select(counterpart);
        self.shared.emit(SessionEvent::UnreadChanged {
            counterpart,
            count: 0,
        });
        debug!("Selected conversation with {}", counterpart);

        let (done_tx, done_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let load = tokio::spawn(async move {
            if let Err(e) = shared.load_history(counterpart, 1).await {
                // Transcript keeps whatever it already has
                warn!("{}", e);
            }
            let _ = done_tx.send(());
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(load);
        done_rx
    }

    /// Load the next older history page for the active conversation
    pub async fn load_older(&self) -> Result<usize> {
        let counterpart = self.active().await.ok_or(ChatError::NoActiveConversation)?;
        let page = self
            .shared
            .next_pages
            .read()
            .await
            .get(&counterpart)
            .copied()
            .unwrap_or(1);
        self.shared.load_history(counterpart, page).await
    }

    /// Optimistically append `content` to the active conversation and hand it to
    /// the transport. A transport failure leaves the entry in place as `Failed`.
    pub async fn send_message(&self, content: &str) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = {
            let mut store = self.shared.store.write().await;
            let counterpart = store.active().ok_or(ChatError::NoActiveConversation)?;
            let message = Message {
                sender_id: self.shared.me,
                receiver_id: counterpart,
                content: content.to_string(),
                timestamp: Utc::now(),
                local_id: Some(LocalId::new()),
            };
            store.insert_local(message.clone());
            message
        };
        self.shared.emit(SessionEvent::TranscriptChanged {
            counterpart: message.receiver_id,
        });

        self.dispatch(message).await
    }

    /// Resubmit a failed optimistic entry under its original local id
    pub async fn retry(&self, local_id: LocalId) -> Result<Message> {
        let message = self
            .shared
            .store
            .write()
            .await
            .mark_retrying(local_id)
            .ok_or_else(|| ChatError::SendFailed {
                local_id,
                reason: "no failed entry with this id".to_string(),
            })?;
        self.dispatch(message).await
    }

    async fn dispatch(&self, message: Message) -> Result<Message> {
        let local_id = message.local_id.unwrap_or_default();
        match self.supervisor.send(&message).await {
            Ok(()) => {
                self.shared.store.write().await.mark_sent(local_id);
                Ok(message)
            }
            Err(e) => {
                warn!("Send to {} failed: {}", message.receiver_id, e);
                self.shared.store.write().await.mark_failed(local_id);
                self.shared.emit(SessionEvent::SendFailed { local_id });
                self.shared.emit(SessionEvent::TranscriptChanged {
                    counterpart: message.receiver_id,
                });
                Err(ChatError::SendFailed {
                    local_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Re-fetch the roster; departed connections disappear from the list
    pub async fn reload_roster(&self) -> usize {
        let profiles = load_roster(self.backend.as_ref()).await;
        let ids: Vec<UserId> = profiles.iter().map(|p| p.id).collect();
        let removed = self.shared.store.write().await.set_roster(&ids);
        for counterpart in &removed {
            info!("Connection {} left the roster", counterpart);
        }

        let size = profiles.len();
        *self.shared.profiles.write().await = profiles;
        self.shared.emit(SessionEvent::RosterChanged { size });
        size
    }

    pub async fn active(&self) -> Option<UserId> {
        self.shared.store.read().await.active()
    }

    pub async fn unread(&self, counterpart: UserId) -> u32 {
        self.shared.store.read().await.unread(counterpart)
    }

    pub async fn transcript(&self, counterpart: UserId) -> Vec<TranscriptEntry> {
        self.shared.store.read().await.transcript(counterpart).to_vec()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.supervisor.state().await
    }

    pub fn presence(&self) -> PresenceReading {
        self.presence.current()
    }

    /// Snapshot of the full view-model
    pub async fn view(&self) -> ChatView {
        let presence = self.presence.current();
        let connection = self.supervisor.state().await;
        let profiles = self.shared.profiles.read().await;
        let names: HashMap<UserId, &str> =
            profiles.iter().map(|p| (p.id, p.display_name())).collect();

        let store = self.shared.store.read().await;
        let conversations = store
            .conversations()
            .into_iter()
            .map(|summary| ConversationRow {
                counterpart: summary.counterpart,
                name: names
                    .get(&summary.counterpart)
                    .copied()
                    .unwrap_or("Unknown User")
                    .to_string(),
                online: presence.snapshot.is_online(summary.counterpart),
                unread: summary.unread,
                last_activity: summary.last_activity,
                preview: summary.preview,
            })
            .collect();
        let active = store.active();
        let transcript = active
            .map(|k| store.transcript(k).to_vec())
            .unwrap_or_default();

        ChatView {
            conversations,
            active,
            transcript,
            connection,
            presence_stale: presence.is_stale(),
        }
    }

    /// Stop polling, close the transport and suppress further reconnects.
    /// Returns once every session task, in-flight history loads included, has
    /// finished; nothing touches the store afterwards.
    pub async fn shutdown(&self) {
        self.presence.stop();
        self.supervisor.close().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
        info!("Chat session for user {} shut down", self.shared.me);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.presence.stop();
        // Without a shutdown nobody will read what pending loads would merge
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn pump_connection_events(mut rx: mpsc::UnboundedReceiver<ConnectionEvent>, shared: Arc<Shared>) {
    while let Some(event) = rx.recv().await {
        shared.apply(event).await;
    }
    debug!("Connection event stream ended");
}

async fn forward_presence(mut rx: watch::Receiver<PresenceReading>, shared: Arc<Shared>) {
    while rx.changed().await.is_ok() {
        let online = rx.borrow().snapshot.0.values().filter(|online| **online).count();
        shared.emit(SessionEvent::PresenceUpdated { online });
    }
}
