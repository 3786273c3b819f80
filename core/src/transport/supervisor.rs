/// Duplex connection lifecycle: connect, authenticate, reconnect with backoff
use crate::auth::Credentials;
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::events::ConnectionEvent;
use crate::transport::backoff::ReconnectPolicy;
use crate::transport::frame::Frame;
use crate::types::Message;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the duplex transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Transport connect in progress
    Connecting,
    /// Transport open, connect frame being written
    Authenticating,
    /// Ready for application traffic
    Open,
    /// Local close in progress
    Closing,
}

/// State shared between the public handle and the run loop
struct Link {
    state: ConnectionState,
    /// Present only while `Open`
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

/// Owns at most one transport at a time and keeps it alive until closed
#[derive(Clone)]
pub struct ConnectionSupervisor {
    url: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    link: Arc<RwLock<Link>>,
    attempt: Arc<AtomicU32>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionSupervisor {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            policy,
            connect_timeout,
            link: Arc::new(RwLock::new(Link {
                state: ConnectionState::Disconnected,
                outbound: None,
            })),
            attempt: Arc::new(AtomicU32::new(0)),
            cancel: CancellationToken::new(),
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.ws_url.clone(),
            ReconnectPolicy::new(config.reconnect_base, config.reconnect_cap),
            config.connect_timeout,
        )
    }

    /// Start the connection loop. Events arrive in transport order until `close`.
    pub async fn open(
        &self,
        credentials: Credentials,
    ) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>> {
        let mut task = self.task.lock().await;
        if task.is_some() || self.cancel.is_cancelled() {
            return Err(ChatError::Transport(
                "supervisor already opened once".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = self.clone();
        *task = Some(tokio::spawn(async move {
            supervisor.run(credentials, tx).await;
        }));

        info!("Connection supervisor started for {}", self.url);
        Ok(rx)
    }

    /// Hand a message to the transport. Fails fast unless `Open`; nothing is buffered.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let link = self.link.read().await;
        if link.state != ConnectionState::Open {
            return Err(ChatError::Transport(format!(
                "socket is {:?}, not open",
                link.state
            )));
        }
        let outbound = link
            .outbound
            .as_ref()
            .ok_or_else(|| ChatError::Transport("no active session".to_string()))?;
        outbound
            .send(Frame::Message(message.clone()))
            .map_err(|_| ChatError::Transport("session closed".to_string()))
    }

    /// Close the transport and stop reconnecting. Safe to call repeatedly.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Connection loop ended abnormally: {}", e);
            }
        }
    }

    /// Stop reconnecting without waiting for the loop to wind down
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub async fn state(&self) -> ConnectionState {
        self.link.read().await.state
    }

    /// Failed/closed cycles since the last successful open
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    async fn run(&self, credentials: Credentials, events: mpsc::UnboundedSender<ConnectionEvent>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.transition(ConnectionState::Connecting, &events).await;
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = timeout(self.connect_timeout, connect_async(self.url.as_str())) => result,
            };

            match connected {
                Ok(Ok((ws, _response))) => {
                    debug!("Transport open to {}", self.url);
                    match self.run_session(ws, &credentials, &events).await {
                        Ok(()) => info!("Connection to {} closed", self.url),
                        Err(e) => warn!("Connection to {} lost: {}", self.url, e),
                    }
                }
                Ok(Err(e)) => warn!("Failed to connect to {}: {}", self.url, e),
                Err(_) => warn!("Connection timeout to {}", self.url),
            }

            self.transition(ConnectionState::Disconnected, &events).await;
            if self.cancel.is_cancelled() {
                break;
            }

            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
            let delay = self.policy.delay(attempt);
            info!("Reconnecting in {:?} (attempt {})", delay, attempt + 1);
            let _ = events.send(ConnectionEvent::ReconnectScheduled {
                attempt: attempt + 1,
                delay,
            });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.transition(ConnectionState::Disconnected, &events).await;
        info!("Connection supervisor stopped");
    }

    /// Drive one open transport until it closes or we are cancelled
    async fn run_session(
        &self,
        ws: WsStream,
        credentials: &Credentials,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<()> {
        let (mut sink, mut stream) = ws.split();

        self.transition(ConnectionState::Authenticating, events).await;
        let connect = Frame::Connect {
            user_id: credentials.user_id.to_string(),
            token: credentials.token.as_str().to_string(),
        };
        sink.send(WsMessage::Text(connect.to_text()?)).await?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        {
            let mut link = self.link.write().await;
            link.state = ConnectionState::Open;
            link.outbound = Some(outbound_tx);
        }
        self.attempt.store(0, Ordering::SeqCst);
        let _ = events.send(ConnectionEvent::ConnectionStateChanged(ConnectionState::Open));
        info!("Connected to {} as user {}", self.url, credentials.user_id);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.transition(ConnectionState::Closing, events).await;
                    if let Ok(text) = Frame::Disconnect.to_text() {
                        let _ = sink.send(WsMessage::Text(text)).await;
                    }
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                    return Ok(());
                }
                Some(frame) = outbound_rx.recv() => {
                    sink.send(WsMessage::Text(frame.to_text()?)).await?;
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => dispatch(&text, events),
                    Some(Ok(WsMessage::Close(reason))) => {
                        debug!("Server closed transport: {:?}", reason);
                        return Ok(());
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        warn!("Dropping binary frame ({} bytes)", data.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn transition(&self, state: ConnectionState, events: &mpsc::UnboundedSender<ConnectionEvent>) {
        let changed = {
            let mut link = self.link.write().await;
            if state != ConnectionState::Open {
                link.outbound = None;
            }
            let changed = link.state != state;
            link.state = state;
            changed
        };
        if changed {
            debug!("Connection state -> {:?}", state);
            let _ = events.send(ConnectionEvent::ConnectionStateChanged(state));
        }
    }
}

/// Parse, validate and re-emit one inbound text frame
fn dispatch(text: &str, events: &mpsc::UnboundedSender<ConnectionEvent>) {
    let event = match Frame::parse(text) {
        Ok(Frame::Message(message)) => ConnectionEvent::Message(message),
        Ok(Frame::Delivered { local_id }) => {
            debug!("Delivery confirmation received");
            ConnectionEvent::DeliveryAck(local_id)
        }
        Ok(Frame::Typing { sender_id, .. }) => {
            debug!("Typing indicator from {}", sender_id);
            ConnectionEvent::TypingIndicator(sender_id)
        }
        Ok(other) => {
            debug!("Ignoring {}", other);
            return;
        }
        Err(e) => {
            warn!("Dropping inbound frame: {}", e);
            return;
        }
    };
    let _ = events.send(event);
}
