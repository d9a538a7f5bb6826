//! Chat message types for Huddle.

use huddle_protocol::{MessageKind, MessageRow, NewMessageRow};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A message identifier: server-assigned, or `temp_*` while optimistic.
pub type MessageId = String;

/// Prefix of locally generated temporary ids.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a locally unique temporary message id.
#[must_use]
pub fn generate_temp_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{TEMP_ID_PREFIX}{timestamp:x}_{counter:x}")
}

/// A chat message, either optimistic (local, unconfirmed) or confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub kind: MessageKind,
    /// Unix milliseconds. Local clock for optimistic entries.
    pub created_at: u64,
    /// Client-generated key used to match the confirmed row to its optimistic entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub optimistic: bool,
}

impl Message {
    /// Build an optimistic text message. Its temporary id doubles as correlation id.
    #[must_use]
    pub fn optimistic(
        temp_id: impl Into<MessageId>,
        channel_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let id = temp_id.into();
        Self {
            correlation_id: Some(id.clone()),
            id,
            channel_id: channel_id.into(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            content: content.into(),
            kind: MessageKind::Text,
            created_at: now_millis(),
            optimistic: true,
        }
    }

    /// Whether this entry has been confirmed by the store.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        !self.optimistic
    }

    /// The insert request that makes this optimistic message durable.
    #[must_use]
    pub fn to_insert(&self) -> NewMessageRow {
        NewMessageRow {
            channel_id: self.channel_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            content: self.content.clone(),
            kind: self.kind,
            correlation_id: self.correlation_id.clone(),
        }
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            channel_id: row.channel_id,
            sender_id: row.sender_id,
            sender_name: row.sender_name,
            content: row.content,
            kind: row.kind,
            created_at: row.created_at,
            correlation_id: row.correlation_id,
            optimistic: false,
        }
    }
}
