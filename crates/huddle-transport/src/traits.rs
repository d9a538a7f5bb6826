//! Collaborator interfaces consumed by the Huddle sync engine.
//!
//! The engine talks to two external services: a request/response
//! [`DataStore`] holding messages and memberships, and a push-based
//! [`ChangeFeed`] delivering row changes for one channel.

use async_trait::async_trait;
use huddle_protocol::{MemberRow, MessageRow, NewMessageRow, RowChange, Table};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The request was not answered in time.
    #[error("Request timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer answered with an error frame.
    #[error("Rejected by peer ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The peer answered with a frame that does not fit the request.
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] huddle_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Data store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The row failed validation.
    #[error("Invalid row: {0}")]
    Invalid(&'static str),

    /// The store refused the request.
    #[error("Store rejected request ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(#[source] TransportError),
}

impl From<TransportError> for StoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected { code, message } => StoreError::Rejected { code, message },
            other => StoreError::Unavailable(other),
        }
    }
}

/// Request/response access to stored chat state.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Message history of a channel, ordered by creation time ascending.
    async fn fetch_messages(&self, channel_id: &str) -> Result<Vec<MessageRow>, StoreError>;

    /// Insert a message. Returns the stored row with server id and timestamp.
    async fn insert_message(&self, row: NewMessageRow) -> Result<MessageRow, StoreError>;

    /// Membership row for `(channel_id, user_id)`, if any.
    async fn fetch_member(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberRow>, StoreError>;

    /// Insert or update a membership row. Returns the stored row.
    async fn upsert_member(&self, row: MemberRow) -> Result<MemberRow, StoreError>;

    /// Members of a channel currently online.
    async fn fetch_online_members(&self, channel_id: &str) -> Result<Vec<MemberRow>, StoreError>;
}

/// Subscription status reported by a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// The subscription was acknowledged.
    Subscribed,
    /// The subscription failed.
    ChannelError(String),
    /// The transport gave up waiting for the subscription.
    TimedOut,
    /// The subscription ended.
    Closed,
}

/// An event pushed by a change feed, in transport arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Status(SubscriptionStatus),
    Change(RowChange),
}

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// Logical topic name, unique per subscriber.
    pub topic: String,
    /// Only rows scoped to this channel are delivered.
    pub channel_id: String,
    /// Tables whose changes are delivered.
    pub tables: Vec<Table>,
}

impl SubscribeRequest {
    /// Whether a change passes this request's filter.
    #[must_use]
    pub fn matches(&self, change: &RowChange) -> bool {
        change.row.channel_id() == self.channel_id && self.tables.contains(&change.table())
    }
}

/// Owner of an open subscription.
///
/// Closing is synchronous and idempotent, so it can run on teardown paths
/// that cannot await. Dropping the handle closes the subscription.
pub struct SubscriptionHandle {
    topic: String,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    /// Create a handle that runs `closer` on the first close.
    pub fn new(topic: impl Into<String>, closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            topic: topic.into(),
            closer: Some(Box::new(closer)),
        }
    }

    /// The subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closer.is_none()
    }

    /// Close the subscription. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        match self.closer.take() {
            Some(closer) => {
                closer();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Push-based delivery of row changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription. Changes and status updates are pushed onto
    /// `sink` in arrival order; the acknowledgment arrives as
    /// `FeedEvent::Status(SubscriptionStatus::Subscribed)`.
    async fn subscribe(
        &self,
        request: SubscribeRequest,
        sink: mpsc::Sender<FeedEvent>,
    ) -> Result<SubscriptionHandle, TransportError>;

    /// Get the transport name (e.g., "memory", "websocket").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::{MemberRole, Row};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_handle_close_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let mut handle = SubscriptionHandle::new("channel_chat_ws-1", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.is_closed());
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes_handle() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        drop(SubscriptionHandle::new("t", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_filter() {
        let request = SubscribeRequest {
            topic: "channel_chat_ws-1".into(),
            channel_id: "ws-1".into(),
            tables: vec![Table::ChannelMember],
        };
        let member = |channel: &str| {
            RowChange::insert(Row::Member(MemberRow {
                channel_id: channel.into(),
                user_id: "u-1".into(),
                role: MemberRole::Member,
                online: true,
                last_seen_at: 1,
            }))
        };

        assert!(request.matches(&member("ws-1")));
        assert!(!request.matches(&member("ws-2")));
    }

    #[test]
    fn test_store_error_from_rejection() {
        let err = StoreError::from(TransportError::Rejected {
            code: 1003,
            message: "content too long".into(),
        });
        assert!(matches!(err, StoreError::Rejected { code: 1003, .. }));

        let err = StoreError::from(TransportError::ConnectionClosed);
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
