/// Conversation state: per-counterpart transcripts, unread counts, recency
///
/// Folds three inputs into one ordered, deduplicated log per conversation:
/// live pushes, history backlogs and optimistic local sends. Insertion is
/// idempotent and commutative for distinct messages, so the arrival order of
/// history and live traffic never changes the final state.
use crate::history::HistoryBatch;
use crate::types::{DeliveryStatus, LocalId, Message, UserId};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub message: Message,
    pub status: DeliveryStatus,
}

/// Row of the recency-ordered conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub counterpart: UserId,
    pub last_activity: Option<DateTime<Utc>>,
    pub unread: u32,
    /// Content of the newest transcript entry
    pub preview: Option<String>,
}

/// Outcome of ingesting one live message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// New entry; `unread` is the new badge count when it was bumped
    Inserted {
        counterpart: UserId,
        unread: Option<u32>,
    },
    /// Already present, nothing added
    Duplicate { counterpart: UserId },
    /// Logged-in user is not a party to the message
    Foreign,
}

#[derive(Debug, Default)]
struct Conversation {
    last_activity: Option<DateTime<Utc>>,
    unread: u32,
    transcript: Vec<TranscriptEntry>,
    on_roster: bool,
}

pub struct ConversationStore {
    me: UserId,
    tolerance: TimeDelta,
    conversations: HashMap<UserId, Conversation>,
    /// First-seen order; the tie-break for the conversation list
    order: Vec<UserId>,
    active: Option<UserId>,
    local_index: HashMap<LocalId, UserId>,
}

impl ConversationStore {
    pub fn new(me: UserId, tolerance: Duration) -> Self {
        Self {
            me,
            tolerance: TimeDelta::from_std(tolerance).unwrap_or_else(|_| TimeDelta::zero()),
            conversations: HashMap::new(),
            order: Vec::new(),
            active: None,
            local_index: HashMap::new(),
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn active(&self) -> Option<UserId> {
        self.active
    }

    pub fn contains(&self, counterpart: UserId) -> bool {
        self.conversations.contains_key(&counterpart)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn unread(&self, counterpart: UserId) -> u32 {
        self.conversations
            .get(&counterpart)
            .map(|c| c.unread)
            .unwrap_or(0)
    }

    pub fn last_activity(&self, counterpart: UserId) -> Option<DateTime<Utc>> {
        self.conversations
            .get(&counterpart)
            .and_then(|c| c.last_activity)
    }

    pub fn transcript(&self, counterpart: UserId) -> &[TranscriptEntry] {
        self.conversations
            .get(&counterpart)
            .map(|c| c.transcript.as_slice())
            .unwrap_or(&[])
    }

    pub fn entry(&self, local_id: LocalId) -> Option<&TranscriptEntry> {
        let counterpart = self.local_index.get(&local_id)?;
        self.conversations
            .get(counterpart)?
            .transcript
            .iter()
            .find(|e| e.message.local_id == Some(local_id))
    }

    /// Make `counterpart` active and zero its unread badge. Buffered messages stay.
    pub fn select(&mut self, counterpart: UserId) {
        self.ensure(counterpart).unread = 0;
        self.active = Some(counterpart);
    }

    /// Replace the roster. Conversations that were on the previous roster but
    /// are missing now are dropped and returned.
    pub fn set_roster(&mut self, ids: &[UserId]) -> Vec<UserId> {
        let keep: HashSet<UserId> = ids.iter().copied().collect();
        let removed: Vec<UserId> = self
            .order
            .iter()
            .copied()
            .filter(|k| {
                self.conversations
                    .get(k)
                    .map(|c| c.on_roster && !keep.contains(k))
                    .unwrap_or(false)
            })
            .collect();

        for counterpart in &removed {
            self.remove(*counterpart);
        }
        for id in ids {
            self.ensure(*id).on_roster = true;
        }
        removed
    }

    /// Live inbound push from the transport
    pub fn ingest_live(&mut self, message: Message) -> Ingest {
        let Some(counterpart) = message.counterpart(self.me) else {
            warn!(
                "Ignoring message {} -> {} not addressed to {}",
                message.sender_id, message.receiver_id, self.me
            );
            return Ingest::Foreign;
        };

        let inbound = message.is_inbound(self.me);
        let status = self.server_status(&message);
        if !self.merge(counterpart, message, status) {
            return Ingest::Duplicate { counterpart };
        }

        let unread = if inbound && self.active != Some(counterpart) {
            let conversation = self.ensure(counterpart);
            conversation.unread += 1;
            Some(conversation.unread)
        } else {
            None
        };
        Ingest::Inserted { counterpart, unread }
    }

    /// Backlog for one conversation. Never touches unread counts or focus.
    pub fn ingest_history(&mut self, batch: &HistoryBatch) -> usize {
        let mut inserted = 0;
        for message in &batch.messages {
            if message.counterpart(self.me) != Some(batch.counterpart) {
                continue;
            }
            let status = self.server_status(message);
            if self.merge(batch.counterpart, message.clone(), status) {
                inserted += 1;
            }
        }
        debug!(
            "History for {}: {} new of {}",
            batch.counterpart,
            inserted,
            batch.messages.len()
        );
        inserted
    }

    /// Optimistic echo of a local send, shown before any confirmation
    pub fn insert_local(&mut self, message: Message) -> Option<UserId> {
        if message.sender_id != self.me || message.local_id.is_none() {
            return None;
        }
        let counterpart = message.counterpart(self.me)?;
        self.merge(counterpart, message, DeliveryStatus::Pending);
        Some(counterpart)
    }

    /// The transport accepted the send
    pub fn mark_sent(&mut self, local_id: LocalId) -> Option<UserId> {
        self.update_status(local_id, |status| match status {
            DeliveryStatus::Pending | DeliveryStatus::Failed => Some(DeliveryStatus::Sent),
            _ => None,
        })
    }

    /// The transport refused the send; the entry is kept, not rolled back
    pub fn mark_failed(&mut self, local_id: LocalId) -> Option<UserId> {
        self.update_status(local_id, |status| match status {
            DeliveryStatus::Pending | DeliveryStatus::Sent => Some(DeliveryStatus::Failed),
            _ => None,
        })
    }

    /// Move a failed entry back to pending for resubmission
    pub fn mark_retrying(&mut self, local_id: LocalId) -> Option<Message> {
        self.update_status(local_id, |status| match status {
            DeliveryStatus::Failed => Some(DeliveryStatus::Pending),
            _ => None,
        })?;
        self.entry(local_id).map(|e| e.message.clone())
    }

    /// Apply a delivery ack naming one local send
    pub fn acknowledge(&mut self, local_id: LocalId) -> Option<UserId> {
        self.update_status(local_id, |status| {
            status
                .is_outbound_unconfirmed()
                .then_some(DeliveryStatus::Delivered)
        })
    }

    /// All known conversations, most recent activity first, never-active last
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        let mut keys = self.order.clone();
        // Stable: ties keep first-seen order
        keys.sort_by(|a, b| {
            let (a, b) = (self.last_activity(*a), self.last_activity(*b));
            match (a, b) {
                (Some(a), Some(b)) => b.cmp(&a),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });

        keys.into_iter()
            .filter_map(|k| {
                let conversation = self.conversations.get(&k)?;
                Some(ConversationSummary {
                    counterpart: k,
                    last_activity: conversation.last_activity,
                    unread: conversation.unread,
                    preview: conversation
                        .transcript
                        .last()
                        .map(|e| e.message.content.clone()),
                })
            })
            .collect()
    }

    fn ensure(&mut self, counterpart: UserId) -> &mut Conversation {
        if !self.conversations.contains_key(&counterpart) {
            self.order.push(counterpart);
        }
        self.conversations.entry(counterpart).or_default()
    }

    fn remove(&mut self, counterpart: UserId) {
        self.conversations.remove(&counterpart);
        self.order.retain(|k| *k != counterpart);
        self.local_index.retain(|_, k| *k != counterpart);
        if self.active == Some(counterpart) {
            self.active = None;
        }
        debug!("Conversation with {} removed", counterpart);
    }

    fn server_status(&self, message: &Message) -> DeliveryStatus {
        if message.sender_id == self.me {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Received
        }
    }

    /// Insert unless an equal message is already present. Returns whether it was new.
    fn merge(&mut self, counterpart: UserId, message: Message, status: DeliveryStatus) -> bool {
        let tolerance = self.tolerance;
        let local_id = message.local_id;
        let conversation = self.ensure(counterpart);
        conversation.last_activity = conversation.last_activity.max(Some(message.timestamp));

        let adopted = match find_duplicate(&conversation.transcript, &message, tolerance) {
            Some(idx) => {
                let entry = &mut conversation.transcript[idx];
                if entry.status.is_outbound_unconfirmed() && status == DeliveryStatus::Delivered {
                    entry.status = DeliveryStatus::Delivered;
                }
                if entry.message.local_id.is_none() && local_id.is_some() {
                    entry.message.local_id = local_id;
                    local_id
                } else {
                    return false;
                }
            }
            None => {
                let ts = message.timestamp;
                let pos = conversation
                    .transcript
                    .partition_point(|e| e.message.timestamp <= ts);
                conversation
                    .transcript
                    .insert(pos, TranscriptEntry { message, status });
                if let Some(id) = local_id {
                    self.local_index.insert(id, counterpart);
                }
                return true;
            }
        };

        if let Some(id) = adopted {
            self.local_index.insert(id, counterpart);
        }
        false
    }

    fn update_status(
        &mut self,
        local_id: LocalId,
        next: impl FnOnce(DeliveryStatus) -> Option<DeliveryStatus>,
    ) -> Option<UserId> {
        let counterpart = *self.local_index.get(&local_id)?;
        let entry = self
            .conversations
            .get_mut(&counterpart)?
            .transcript
            .iter_mut()
            .find(|e| e.message.local_id == Some(local_id))?;
        entry.status = next(entry.status)?;
        Some(counterpart)
    }
}

/// Position of an entry that is logically the same message, if any.
/// A matching `local_id` wins; otherwise sender, receiver and content must be
/// equal within the timestamp tolerance, and two distinct local sends never match.
fn find_duplicate(transcript: &[TranscriptEntry], message: &Message, tolerance: TimeDelta) -> Option<usize> {
    if let Some(id) = message.local_id {
        if let Some(idx) = transcript
            .iter()
            .position(|e| e.message.local_id == Some(id))
        {
            return Some(idx);
        }
    }

    let lower = message.timestamp - tolerance;
    let upper = message.timestamp + tolerance;
    let start = transcript.partition_point(|e| e.message.timestamp < lower);
    transcript[start..]
        .iter()
        .take_while(|e| e.message.timestamp <= upper)
        .position(|e| {
            let existing = &e.message;
            let both_local = existing.local_id.is_some() && message.local_id.is_some();
            !both_local
                && existing.sender_id == message.sender_id
                && existing.receiver_id == message.receiver_id
                && existing.content == message.content
        })
        .map(|offset| start + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ME: UserId = UserId(1);
    const B: UserId = UserId(2);
    const C: UserId = UserId(3);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(from: UserId, to: UserId, text: &str, secs: i64) -> Message {
        Message {
            sender_id: from,
            receiver_id: to,
            content: text.to_string(),
            timestamp: at(secs),
            local_id: None,
        }
    }

    fn store() -> ConversationStore {
        ConversationStore::new(ME, Duration::from_secs(2))
    }

    fn contents(store: &ConversationStore, k: UserId) -> Vec<String> {
        store
            .transcript(k)
            .iter()
            .map(|e| e.message.content.clone())
            .collect()
    }

    #[test]
    fn test_reinserting_same_message_is_noop() {
        let mut store = store();
        let m = msg(B, ME, "hello", 10);
        assert!(matches!(store.ingest_live(m.clone()), Ingest::Inserted { .. }));
        assert_eq!(store.ingest_live(m), Ingest::Duplicate { counterpart: B });
        assert_eq!(store.transcript(B).len(), 1);
        assert_eq!(store.unread(B), 1);
    }

    #[test]
    fn test_transcript_sorted_regardless_of_arrival() {
        let mut store = store();
        for (text, secs) in [("c", 30), ("a", 10), ("e", 50), ("b", 20), ("d", 40)] {
            store.ingest_live(msg(B, ME, text, secs));
        }
        assert_eq!(contents(&store, B), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut store = ConversationStore::new(ME, Duration::ZERO);
        store.ingest_live(msg(B, ME, "first", 10));
        store.ingest_live(msg(ME, B, "second", 10));
        store.ingest_live(msg(B, ME, "third", 10));
        assert_eq!(contents(&store, B), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unread_counts_only_inactive_inbound() {
        let mut store = store();
        store.select(C);
        store.ingest_live(msg(B, ME, "one", 10));
        store.ingest_live(msg(B, ME, "two", 20));
        store.ingest_live(msg(ME, B, "mine", 30));
        store.ingest_live(msg(C, ME, "active", 40));
        assert_eq!(store.unread(B), 2);
        assert_eq!(store.unread(C), 0);
    }

    #[test]
    fn test_select_clears_until_next_inactive_inbound() {
        let mut store = store();
        store.ingest_live(msg(B, ME, "one", 10));
        store.select(B);
        assert_eq!(store.unread(B), 0);
        assert_eq!(store.transcript(B).len(), 1);

        store.ingest_live(msg(B, ME, "while active", 20));
        assert_eq!(store.unread(B), 0);

        store.select(C);
        assert_eq!(
            store.ingest_live(msg(B, ME, "while away", 30)),
            Ingest::Inserted { counterpart: B, unread: Some(1) }
        );
    }

    #[test]
    fn test_history_never_bumps_unread() {
        let mut store = store();
        let batch = HistoryBatch {
            counterpart: B,
            page: 1,
            messages: vec![msg(B, ME, "old", 5), msg(ME, B, "older reply", 6)],
        };
        assert_eq!(store.ingest_history(&batch), 2);
        assert_eq!(store.unread(B), 0);
        assert_eq!(store.last_activity(B), Some(at(6)));
        assert_eq!(store.ingest_history(&batch), 0);
    }

    #[test]
    fn test_history_and_live_commute() {
        let live = msg(B, ME, "live", 20);
        let batch = HistoryBatch {
            counterpart: B,
            page: 1,
            messages: vec![msg(B, ME, "old", 5), live.clone()],
        };

        let mut first = store();
        first.ingest_live(live.clone());
        first.ingest_history(&batch);

        let mut second = store();
        second.ingest_history(&batch);
        second.ingest_live(live);

        assert_eq!(first.transcript(B), second.transcript(B));
        assert_eq!(contents(&first, B), vec!["old", "live"]);
    }

    #[test]
    fn test_recency_ordering_nulls_last() {
        let mut store = store();
        let (t1, t2, t3) = (UserId(11), UserId(12), UserId(13));
        store.set_roster(&[t1, t2, t3]);
        store.ingest_live(msg(t1, ME, "x", 5));
        store.ingest_live(msg(t3, ME, "y", 9));

        let order: Vec<UserId> = store.conversations().iter().map(|c| c.counterpart).collect();
        assert_eq!(order, vec![t3, t1, t2]);
    }

    #[test]
    fn test_never_contacted_keep_roster_order() {
        let mut store = store();
        store.set_roster(&[UserId(7), UserId(5), UserId(6)]);
        store.ingest_live(msg(UserId(6), ME, "hi", 1));
        let order: Vec<UserId> = store.conversations().iter().map(|c| c.counterpart).collect();
        assert_eq!(order, vec![UserId(6), UserId(7), UserId(5)]);
    }

    #[test]
    fn test_optimistic_echo_reconciles_by_local_id() {
        let mut store = store();
        let mut local = msg(ME, B, "hi", 10);
        let id = LocalId::new();
        local.local_id = Some(id);
        store.insert_local(local.clone());
        store.mark_sent(id);

        // Server copy: same local id, later timestamp beyond tolerance
        let mut echo = local.clone();
        echo.timestamp = at(60);
        assert_eq!(store.ingest_live(echo), Ingest::Duplicate { counterpart: B });
        assert_eq!(store.transcript(B).len(), 1);
        assert_eq!(store.entry(id).unwrap().status, DeliveryStatus::Delivered);
    }

    #[test]
    fn test_history_copy_of_local_send_collapses_within_tolerance() {
        let mut store = store();
        let mut local = msg(ME, B, "hi", 10);
        local.local_id = Some(LocalId::new());
        store.insert_local(local);

        let batch = HistoryBatch {
            counterpart: B,
            page: 1,
            messages: vec![msg(ME, B, "hi", 11)],
        };
        assert_eq!(store.ingest_history(&batch), 0);
        assert_eq!(store.transcript(B).len(), 1);
    }

    #[test]
    fn test_two_deliberate_sends_are_not_merged() {
        let mut store = store();
        for _ in 0..2 {
            let mut local = msg(ME, B, "ok", 10);
            local.local_id = Some(LocalId::new());
            store.insert_local(local);
        }
        assert_eq!(store.transcript(B).len(), 2);
    }

    #[test]
    fn test_outside_tolerance_is_distinct() {
        let mut store = store();
        store.ingest_live(msg(B, ME, "ping", 10));
        store.ingest_live(msg(B, ME, "ping", 13));
        assert_eq!(store.transcript(B).len(), 2);
    }

    #[test]
    fn test_failed_send_stays_and_can_retry() {
        let mut store = store();
        let mut local = msg(ME, B, "hi", 10);
        let id = LocalId::new();
        local.local_id = Some(id);
        store.insert_local(local.clone());

        assert_eq!(store.mark_failed(id), Some(B));
        assert_eq!(store.transcript(B).len(), 1);
        assert_eq!(store.entry(id).unwrap().status, DeliveryStatus::Failed);

        assert_eq!(store.mark_retrying(id), Some(local));
        assert_eq!(store.entry(id).unwrap().status, DeliveryStatus::Pending);
        assert!(store.mark_retrying(id).is_none());
    }

    #[test]
    fn test_ack_applies_only_to_the_named_send() {
        let mut store = store();
        // To an offline counterpart: the server never acks this one
        let mut to_offline = msg(ME, B, "are you there", 10);
        let offline_id = LocalId::new();
        to_offline.local_id = Some(offline_id);
        store.insert_local(to_offline);
        store.mark_sent(offline_id);

        let mut to_online = msg(ME, C, "hello", 20);
        let online_id = LocalId::new();
        to_online.local_id = Some(online_id);
        store.insert_local(to_online);
        store.mark_sent(online_id);

        assert_eq!(store.acknowledge(online_id), Some(C));
        assert_eq!(store.entry(online_id).unwrap().status, DeliveryStatus::Delivered);
        assert_eq!(store.entry(offline_id).unwrap().status, DeliveryStatus::Sent);

        // Acking twice or acking an unknown id changes nothing
        assert_eq!(store.acknowledge(online_id), None);
        assert_eq!(store.acknowledge(LocalId::new()), None);
        assert_eq!(store.entry(offline_id).unwrap().status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_roster_reload_drops_departed_connections_only() {
        let mut store = store();
        store.set_roster(&[B, C]);
        store.ingest_live(msg(UserId(9), ME, "stranger", 1));
        store.select(C);

        assert_eq!(store.set_roster(&[B]), vec![C]);
        assert!(!store.contains(C));
        assert!(store.contains(UserId(9)));
        assert_eq!(store.active(), None);
    }

    #[test]
    fn test_foreign_message_is_ignored() {
        let mut store = store();
        assert_eq!(store.ingest_live(msg(B, C, "not mine", 1)), Ingest::Foreign);
        assert!(store.is_empty());
    }
}
