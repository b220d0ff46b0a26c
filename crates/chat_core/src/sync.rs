use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelUrl, DeliveryState, MessageId, UserId},
    error::BackendError,
    protocol::MessageRecord,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    backend::ChatBackend,
    error::{ChatError, ChatResult},
    session::SessionManager,
};

/// One entry in a channel's local message list.
#[derive(Debug, Clone)]
pub struct Message {
    /// Backend-assigned id; `None` while an optimistic send is in flight.
    pub message_id: Option<MessageId>,
    /// Stable local key, useful while `message_id` is absent.
    pub local_id: Uuid,
    pub channel_url: ChannelUrl,
    pub sender_id: UserId,
    pub sender_nickname: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl Message {
    pub fn from_record(record: MessageRecord) -> Self {
        Self {
            message_id: Some(record.message_id),
            local_id: Uuid::new_v4(),
            channel_url: record.channel_url,
            sender_id: record.sender_id,
            sender_nickname: record.sender_nickname,
            body: record.body,
            created_at: record.created_at,
            delivery: DeliveryState::Sent,
        }
    }
}

/// Tick state for one outgoing message, derived on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStatus {
    pub is_delivered: bool,
    pub is_read: bool,
    /// Members still to read past the message; `None` when unknown.
    pub unread_member_count: Option<u32>,
}

impl ReadStatus {
    fn not_delivered() -> Self {
        Self {
            is_delivered: false,
            is_read: false,
            unread_member_count: None,
        }
    }
}

fn dedup_page(records: Vec<MessageRecord>) -> (Vec<Message>, usize) {
    let mut page = Vec::with_capacity(records.len());
    let mut seen = HashSet::new();
    let mut duplicates = 0usize;
    for record in records {
        if !seen.insert(record.message_id) {
            duplicates += 1;
            continue;
        }
        page.push(Message::from_record(record));
    }
    (page, duplicates)
}

/// Merges history pages and push deliveries into one deduplicated,
/// time-ordered list per channel, and owns those lists.
pub struct MessageSynchronizer {
    backend: Arc<dyn ChatBackend>,
    sessions: Arc<SessionManager>,
    buffers: Mutex<HashMap<ChannelUrl, Vec<Message>>>,
}

impl MessageSynchronizer {
    pub fn new(backend: Arc<dyn ChatBackend>, sessions: Arc<SessionManager>) -> Self {
        Self {
            backend,
            sessions,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the most recent `page_size` messages, oldest first, and replace
    /// the channel's buffer with the deduplicated page.
    pub async fn load_history(
        &self,
        channel_url: &ChannelUrl,
        page_size: usize,
    ) -> ChatResult<Vec<Message>> {
        self.sessions.session()?;

        let records = self
            .backend
            .previous_messages(channel_url, page_size)
            .await?;
        let (page, duplicates) = dedup_page(records);
        if duplicates > 0 {
            warn!(
                channel_url = %channel_url,
                duplicates,
                "sync: dropped duplicate history entries"
            );
        }

        let mut buffers = self.buffers.lock().expect("message buffer lock poisoned");
        buffers.insert(channel_url.clone(), page.clone());
        Ok(page)
    }

    /// Append a pushed message unless its id is already present. Receiving
    /// the same push twice, or the echo of an own send, changes nothing.
    /// Returns the appended entry, or `None` when the buffer was left alone.
    pub fn merge_incoming(
        &self,
        channel_url: &ChannelUrl,
        record: MessageRecord,
    ) -> Option<Message> {
        let mut buffers = self.buffers.lock().expect("message buffer lock poisoned");
        let buffer = buffers.entry(channel_url.clone()).or_default();
        if buffer
            .iter()
            .any(|message| message.message_id == Some(record.message_id))
        {
            debug!(
                channel_url = %channel_url,
                message_id = %record.message_id,
                "sync: duplicate merge ignored"
            );
            return None;
        }
        let message = Message::from_record(record);
        buffer.push(message.clone());
        Some(message)
    }

    /// Send a message and await the outcome.
    ///
    /// An optimistic pending entry appears in the buffer immediately. The
    /// backend's completion callback is adapted into an awaitable result: on
    /// success the entry is promoted in place to sent, on failure it is
    /// marked failed and kept so the caller can surface it.
    pub async fn send(&self, channel_url: &ChannelUrl, body: &str) -> ChatResult<Message> {
        let session = self.sessions.session()?;

        let pending = Message {
            message_id: None,
            local_id: Uuid::new_v4(),
            channel_url: channel_url.clone(),
            sender_id: session.user_id.clone(),
            sender_nickname: Some(session.display_name.clone()),
            body: body.to_owned(),
            created_at: Utc::now(),
            delivery: DeliveryState::Pending,
        };
        let local_id = pending.local_id;
        {
            let mut buffers = self.buffers.lock().expect("message buffer lock poisoned");
            buffers
                .entry(channel_url.clone())
                .or_default()
                .push(pending);
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.backend.send_message(
            channel_url,
            body,
            Box::new(move |outcome| {
                let _ = done_tx.send(outcome);
            }),
        );

        let outcome = match done_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::internal("send completion dropped")),
        };

        match outcome {
            Ok(record) => Ok(self.promote_pending(channel_url, local_id, record)),
            Err(err) => {
                self.mark_send_failed(channel_url, local_id);
                Err(ChatError::SendFailed {
                    channel_url: channel_url.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    fn promote_pending(
        &self,
        channel_url: &ChannelUrl,
        local_id: Uuid,
        record: MessageRecord,
    ) -> Message {
        let mut buffers = self.buffers.lock().expect("message buffer lock poisoned");
        let buffer = buffers.entry(channel_url.clone()).or_default();

        // The push echo may have merged this id before the callback resolved.
        let echo = buffer
            .iter()
            .find(|message| {
                message.message_id == Some(record.message_id) && message.local_id != local_id
            })
            .cloned();
        if let Some(echo) = echo {
            buffer.retain(|message| message.local_id != local_id);
            return echo;
        }

        if let Some(slot) = buffer
            .iter_mut()
            .find(|message| message.local_id == local_id)
        {
            slot.message_id = Some(record.message_id);
            slot.sender_nickname = record.sender_nickname.clone();
            slot.body = record.body.clone();
            slot.created_at = record.created_at;
            slot.delivery = DeliveryState::Sent;
            return slot.clone();
        }

        // Buffer was reloaded while the send was in flight.
        let message = Message::from_record(record);
        buffer.push(message.clone());
        message
    }

    fn mark_send_failed(&self, channel_url: &ChannelUrl, local_id: Uuid) {
        let mut buffers = self.buffers.lock().expect("message buffer lock poisoned");
        if let Some(buffer) = buffers.get_mut(channel_url) {
            if let Some(slot) = buffer
                .iter_mut()
                .find(|message| message.local_id == local_id)
            {
                slot.delivery = DeliveryState::Failed;
            }
        }
    }

    /// Derive the tick state for one of the current user's messages.
    ///
    /// Hits the unread-count query on every call and caches nothing; counts
    /// move as peers read, so any cache would be stale immediately. With long
    /// visible lists this fans out one query per outgoing message per
    /// refresh, a cost that grows with member and message counts.
    pub async fn compute_read_status(
        &self,
        channel_url: &ChannelUrl,
        message: &Message,
    ) -> ChatResult<ReadStatus> {
        self.sessions.session()?;

        if message.delivery != DeliveryState::Sent {
            return Ok(ReadStatus::not_delivered());
        }
        let Some(message_id) = message.message_id else {
            return Ok(ReadStatus::not_delivered());
        };

        match self
            .backend
            .unread_member_count(channel_url, message_id)
            .await
        {
            Ok(unread) => Ok(ReadStatus {
                is_delivered: true,
                is_read: unread == 0,
                unread_member_count: Some(unread),
            }),
            Err(err) => {
                warn!(
                    channel_url = %channel_url,
                    message_id = %message_id,
                    error = %err,
                    "sync: unread count query failed"
                );
                Ok(ReadStatus {
                    is_delivered: true,
                    is_read: false,
                    unread_member_count: None,
                })
            }
        }
    }

    /// Tell the backend everything up to the latest message has been read.
    /// Safe to repeat.
    pub async fn mark_read(&self, channel_url: &ChannelUrl) -> ChatResult<()> {
        self.sessions.session()?;
        self.backend.mark_read(channel_url).await?;
        Ok(())
    }

    /// Snapshot of the channel's current list.
    pub fn messages(&self, channel_url: &ChannelUrl) -> Vec<Message> {
        self.buffers
            .lock()
            .expect("message buffer lock poisoned")
            .get(channel_url)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.buffers.lock().expect("message buffer lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, body: &str) -> MessageRecord {
        MessageRecord {
            message_id: MessageId(id),
            channel_url: ChannelUrl::new("chan"),
            sender_id: UserId::new("alice"),
            sender_nickname: Some("Alice".into()),
            body: body.into(),
            created_at: DateTime::<Utc>::from_timestamp(id, 0).expect("timestamp"),
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let (page, duplicates) = dedup_page(vec![
            record(1, "first"),
            record(2, "second"),
            record(1, "first again"),
        ]);
        assert_eq!(duplicates, 1);
        let ids: Vec<i64> = page.iter().map(|m| m.message_id.expect("id").0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(page[0].body, "first");
    }

    #[test]
    fn dedup_passes_clean_pages_through() {
        let (page, duplicates) = dedup_page(vec![record(1, "a"), record(2, "b")]);
        assert_eq!(duplicates, 0);
        assert_eq!(page.len(), 2);
    }
}
