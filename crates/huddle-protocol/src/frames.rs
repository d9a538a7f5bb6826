//! Frame types for the Huddle protocol.
//!
//! A single connection multiplexes two kinds of traffic:
//! request/response store operations correlated by `id`, and change-feed
//! subscriptions whose row changes are pushed as `Change` frames.

use serde::{Deserialize, Serialize};

use crate::rows::{MemberRow, MessageRow, NewMessageRow, RowChange, Table};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Change,
    FetchMessages,
    Messages,
    InsertMessage,
    MessageInserted,
    FetchMember,
    Member,
    UpsertMember,
    MemberUpserted,
    FetchOnlineMembers,
    Members,
    Ack,
    Error,
    Ping,
    Pong,
}

impl FrameType {
    /// Stable label, used for logging and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Connected => "connected",
            FrameType::Subscribe => "subscribe",
            FrameType::Unsubscribe => "unsubscribe",
            FrameType::Change => "change",
            FrameType::FetchMessages => "fetch_messages",
            FrameType::Messages => "messages",
            FrameType::InsertMessage => "insert_message",
            FrameType::MessageInserted => "message_inserted",
            FrameType::FetchMember => "fetch_member",
            FrameType::Member => "member",
            FrameType::UpsertMember => "upsert_member",
            FrameType::MemberUpserted => "member_upserted",
            FrameType::FetchOnlineMembers => "fetch_online_members",
            FrameType::Members => "members",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol major version.
        version: u8,
        /// Optional authentication token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        connection_id: String,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Open a change-feed subscription. Acknowledged with `Ack { id }`.
    #[serde(rename = "subscribe")]
    Subscribe {
        id: u64,
        /// Logical topic name, unique per subscriber.
        topic: String,
        /// Only rows scoped to this channel are delivered.
        channel_id: String,
        tables: Vec<Table>,
    },

    /// Close a change-feed subscription.
    #[serde(rename = "unsubscribe")]
    Unsubscribe { id: u64, topic: String },

    /// A row change pushed on a subscribed topic.
    #[serde(rename = "change")]
    Change { topic: String, change: RowChange },

    /// Read the message history of a channel.
    #[serde(rename = "fetch_messages")]
    FetchMessages { id: u64, channel_id: String },

    /// History response, ordered by creation time.
    #[serde(rename = "messages")]
    Messages { id: u64, rows: Vec<MessageRow> },

    /// Insert a message row.
    #[serde(rename = "insert_message")]
    InsertMessage { id: u64, row: NewMessageRow },

    /// Insert response carrying the server-assigned id and timestamp.
    #[serde(rename = "message_inserted")]
    MessageInserted { id: u64, row: MessageRow },

    /// Read one membership row.
    #[serde(rename = "fetch_member")]
    FetchMember {
        id: u64,
        channel_id: String,
        user_id: String,
    },

    /// Membership lookup response.
    #[serde(rename = "member")]
    Member {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row: Option<MemberRow>,
    },

    /// Insert or update a membership row.
    #[serde(rename = "upsert_member")]
    UpsertMember { id: u64, row: MemberRow },

    /// Upsert response carrying the stored row.
    #[serde(rename = "member_upserted")]
    MemberUpserted { id: u64, row: MemberRow },

    /// Read the online roster of a channel.
    #[serde(rename = "fetch_online_members")]
    FetchOnlineMembers { id: u64, channel_id: String },

    /// Roster response.
    #[serde(rename = "members")]
    Members { id: u64, rows: Vec<MemberRow> },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack { id: u64 },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Change { .. } => FrameType::Change,
            Frame::FetchMessages { .. } => FrameType::FetchMessages,
            Frame::Messages { .. } => FrameType::Messages,
            Frame::InsertMessage { .. } => FrameType::InsertMessage,
            Frame::MessageInserted { .. } => FrameType::MessageInserted,
            Frame::FetchMember { .. } => FrameType::FetchMember,
            Frame::Member { .. } => FrameType::Member,
            Frame::UpsertMember { .. } => FrameType::UpsertMember,
            Frame::MemberUpserted { .. } => FrameType::MemberUpserted,
            Frame::FetchOnlineMembers { .. } => FrameType::FetchOnlineMembers,
            Frame::Members { .. } => FrameType::Members,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Request id used to correlate a response with its request, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Subscribe { id, .. }
            | Frame::Unsubscribe { id, .. }
            | Frame::FetchMessages { id, .. }
            | Frame::Messages { id, .. }
            | Frame::InsertMessage { id, .. }
            | Frame::MessageInserted { id, .. }
            | Frame::FetchMember { id, .. }
            | Frame::Member { id, .. }
            | Frame::UpsertMember { id, .. }
            | Frame::MemberUpserted { id, .. }
            | Frame::FetchOnlineMembers { id, .. }
            | Frame::Members { id, .. }
            | Frame::Ack { id }
            | Frame::Error { id, .. } => Some(*id),
            Frame::Connect { .. }
            | Frame::Connected { .. }
            | Frame::Change { .. }
            | Frame::Ping { .. }
            | Frame::Pong { .. } => None,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(
        id: u64,
        topic: impl Into<String>,
        channel_id: impl Into<String>,
        tables: Vec<Table>,
    ) -> Self {
        Frame::Subscribe {
            id,
            topic: topic.into(),
            channel_id: channel_id.into(),
            tables,
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, topic: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            id,
            topic: topic.into(),
        }
    }

    /// Create a new Change frame.
    #[must_use]
    pub fn change(topic: impl Into<String>, change: RowChange) -> Self {
        Frame::Change {
            topic: topic.into(),
            change,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame with timestamp.
    #[must_use]
    pub fn ping_with_timestamp(timestamp: u64) -> Self {
        Frame::Ping {
            timestamp: Some(timestamp),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }
}

/// Error codes carried by `Frame::Error`.
pub mod codes {
    /// The frame could not be decoded or was not expected.
    pub const INVALID_FRAME: u16 = 1001;
    /// The subscription could not be opened.
    pub const SUBSCRIBE_FAILED: u16 = 1002;
    /// The store rejected the request.
    pub const STORE_REJECTED: u16 = 1003;
    /// Unsubscribe for a topic that is not subscribed.
    pub const NOT_SUBSCRIBED: u16 = 1008;
}
