/// On-demand history backlog per conversation
use crate::backend::ChatBackend;
use crate::error::{ChatError, Result};
use crate::types::{Message, UserId};
use std::sync::Arc;
use tracing::{debug, warn};

/// A loaded backlog, tagged with the conversation it was requested for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryBatch {
    pub counterpart: UserId,
    pub page: u32,
    /// Oldest first
    pub messages: Vec<Message>,
}

#[derive(Clone)]
pub struct HistoryLoader {
    me: UserId,
    backend: Arc<dyn ChatBackend>,
}

impl HistoryLoader {
    pub fn new(me: UserId, backend: Arc<dyn ChatBackend>) -> Self {
        Self { me, backend }
    }

    /// Most recent page of history with `counterpart`
    pub async fn load(&self, counterpart: UserId) -> Result<HistoryBatch> {
        self.load_page(counterpart, 1).await
    }

    /// Older pages are numbered upwards from 1
    pub async fn load_page(&self, counterpart: UserId, page: u32) -> Result<HistoryBatch> {
        let records = self
            .backend
            .fetch_history(counterpart, page)
            .await
            .map_err(|e| ChatError::HistoryLoad {
                counterpart,
                reason: e.to_string(),
            })?;

        // Server order is newest first
        let mut messages: Vec<Message> = Vec::with_capacity(records.len());
        for record in records.into_iter().rev() {
            let message: Message = record.into();
            if message.counterpart(self.me) != Some(counterpart) {
                warn!(
                    "Dropping history record {} -> {} outside conversation with {}",
                    message.sender_id, message.receiver_id, counterpart
                );
                continue;
            }
            messages.push(message);
        }

        debug!("Loaded {} history messages with {} (page {})", messages.len(), counterpart, page);
        Ok(HistoryBatch {
            counterpart,
            page,
            messages,
        })
    }
}
