/// REST collaborators: roster, profiles, history, presence
///
/// Endpoints (relative to `api_base`):
///   GET /connections                 -> [id, ...]
///   GET /users/:id                   -> {"id", "name", "photo"}
///   GET /chats?receiver_id=N&page=P  -> newest-first history (or null)
///   GET /users/online-status         -> {"<id>": bool, ...}
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::types::{Message, PresenceSnapshot, Profile, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// One persisted message as the history endpoint returns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(alias = "content")]
    pub message: String,
    #[serde(alias = "timestamp", alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered: bool,
}

impl From<HistoryRecord> for Message {
    fn from(record: HistoryRecord) -> Self {
        Message {
            sender_id: record.sender_id,
            receiver_id: record.receiver_id,
            content: record.message,
            timestamp: record.created_at,
            local_id: None,
        }
    }
}

/// Server-side collaborators the conversation engine consumes
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Ids the logged-in user may message, server order
    async fn fetch_connections(&self) -> Result<Vec<UserId>>;

    async fn fetch_user_minimal(&self, id: UserId) -> Result<Profile>;

    /// One page (1-based) of history with `counterpart`, newest first
    async fn fetch_history(&self, counterpart: UserId, page: u32) -> Result<Vec<HistoryRecord>>;

    async fn fetch_presence(&self) -> Result<PresenceSnapshot>;
}

/// Resolve the roster to minimal profiles, keeping server order.
/// Lookups that fail are skipped; a failed roster fetch yields an empty roster.
pub async fn load_roster(backend: &dyn ChatBackend) -> Vec<Profile> {
    let ids = match backend.fetch_connections().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!("Failed to load connections: {}", e);
            return Vec::new();
        }
    };

    let lookups = ids.iter().map(|id| backend.fetch_user_minimal(*id));
    let mut profiles = Vec::with_capacity(ids.len());
    for (id, result) in ids.iter().zip(join_all(lookups).await) {
        match result {
            Ok(profile) => profiles.push(profile),
            Err(e) => warn!("Skipping connection {}: {}", id, e),
        }
    }
    debug!("Roster resolved: {}/{} profiles", profiles.len(), ids.len());
    profiles
}

/// `reqwest` implementation against the matchmaking server
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: String,
}

impl HttpBackend {
    pub fn new(base: impl Into<String>, token: &str, request_timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let cookie = HeaderValue::from_str(&format!("token={}", token))
            .map_err(|e| ChatError::InvalidToken(e.to_string()))?;
        headers.insert(COOKIE, cookie);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let token = config
            .token
            .as_deref()
            .ok_or_else(|| ChatError::InvalidToken("missing token".to_string()))?;
        Self::new(config.api_base.clone(), token, config.connect_timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn fetch_connections(&self) -> Result<Vec<UserId>> {
        let ids: Option<Vec<UserId>> = self
            .client
            .get(self.url("/connections"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ids.unwrap_or_default())
    }

    async fn fetch_user_minimal(&self, id: UserId) -> Result<Profile> {
        let profile = self
            .client
            .get(self.url(&format!("/users/{}", id)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(profile)
    }

    async fn fetch_history(&self, counterpart: UserId, page: u32) -> Result<Vec<HistoryRecord>> {
        // An empty history is encoded as `null`
        let records: Option<Vec<HistoryRecord>> = self
            .client
            .get(self.url("/chats"))
            .query(&[("receiver_id", counterpart.0.to_string()), ("page", page.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(records.unwrap_or_default())
    }

    async fn fetch_presence(&self) -> Result<PresenceSnapshot> {
        let snapshot = self
            .client
            .get(self.url("/users/online-status"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(snapshot)
    }
}
