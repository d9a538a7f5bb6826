//! Row payloads exchanged with the data store and carried by the change feed.
//!
//! Rows are the storage-side representation of chat state. The client core
//! converts them into its own `Message` / `Membership` types.

use serde::{Deserialize, Serialize};

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Regular user-authored text.
    #[default]
    Text,
    /// Generated notice (joins, topic changes, ...).
    System,
}

/// Role of a channel member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    #[default]
    Member,
}

/// Tables that emit row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    #[serde(rename = "chat_message")]
    ChatMessage,
    #[serde(rename = "channel_member")]
    ChannelMember,
}

impl Table {
    /// Table name as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::ChatMessage => "chat_message",
            Table::ChannelMember => "channel_member",
        }
    }
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Server-assigned identifier.
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    /// Server-assigned creation time (Unix milliseconds).
    pub created_at: u64,
    /// Client-generated correlation id, echoed verbatim by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// A message insert request. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessageRow {
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl NewMessageRow {
    /// Materialize the stored row once the store has assigned an id and timestamp.
    #[must_use]
    pub fn into_row(self, id: impl Into<String>, created_at: u64) -> MessageRow {
        MessageRow {
            id: id.into(),
            channel_id: self.channel_id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            content: self.content,
            kind: self.kind,
            created_at,
            correlation_id: self.correlation_id,
        }
    }
}

/// A channel membership row, unique per `(channel_id, user_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRow {
    pub channel_id: String,
    pub user_id: String,
    #[serde(default)]
    pub role: MemberRole,
    pub online: bool,
    /// Unix milliseconds.
    pub last_seen_at: u64,
}

/// Change kinds delivered by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A row payload tagged with its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "record")]
pub enum Row {
    #[serde(rename = "chat_message")]
    Message(MessageRow),
    #[serde(rename = "channel_member")]
    Member(MemberRow),
}

impl Row {
    /// The table this row belongs to.
    #[must_use]
    pub fn table(&self) -> Table {
        match self {
            Row::Message(_) => Table::ChatMessage,
            Row::Member(_) => Table::ChannelMember,
        }
    }

    /// The channel this row is scoped to.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        match self {
            Row::Message(row) => &row.channel_id,
            Row::Member(row) => &row.channel_id,
        }
    }
}

/// A row-level change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub row: Row,
}

impl RowChange {
    #[must_use]
    pub fn insert(row: Row) -> Self {
        Self {
            kind: ChangeKind::Insert,
            row,
        }
    }

    #[must_use]
    pub fn update(row: Row) -> Self {
        Self {
            kind: ChangeKind::Update,
            row,
        }
    }

    #[must_use]
    pub fn table(&self) -> Table {
        self.row.table()
    }
}
