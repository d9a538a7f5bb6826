//! In-memory data store and change feed.
//!
//! `MemoryBackend` keeps message and membership rows in concurrent maps and
//! fans row changes out to live subscriptions over one broadcast channel per
//! chat channel. A write publishes its change before the write call returns,
//! the same ordering a database-backed change feed gives.

use crate::traits::{
    ChangeFeed, DataStore, FeedEvent, StoreError, SubscribeRequest, SubscriptionHandle,
    SubscriptionStatus, TransportError,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_protocol::{MemberRow, MessageRow, NewMessageRow, Row, RowChange};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Default broadcast capacity per chat channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default maximum message length in bytes.
const DEFAULT_MAX_CONTENT_LENGTH: usize = 4096;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// In-memory backend configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Broadcast capacity per chat channel.
    pub channel_capacity: usize,
    /// Maximum message content length in bytes.
    pub max_content_length: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

/// Data store and change feed backed by process memory.
#[derive(Debug)]
pub struct MemoryBackend {
    /// Message rows per chat channel, in insertion order.
    messages: DashMap<String, Vec<MessageRow>>,
    /// Membership rows keyed by (channel, user).
    members: DashMap<(String, String), MemberRow>,
    /// Change fan-out per chat channel.
    feeds: DashMap<String, broadcast::Sender<Arc<RowChange>>>,
    /// Open subscriptions per chat channel.
    subscriptions: Arc<DashMap<String, usize>>,
    next_id: AtomicU64,
    config: MemoryConfig,
}

impl MemoryBackend {
    /// Create a backend with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create a backend with custom configuration.
    #[must_use]
    pub fn with_config(config: MemoryConfig) -> Self {
        debug!("Creating in-memory backend with config: {:?}", config);
        Self {
            messages: DashMap::new(),
            members: DashMap::new(),
            feeds: DashMap::new(),
            subscriptions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            config,
        }
    }

    /// Number of stored messages in a channel.
    #[must_use]
    pub fn message_count(&self, channel_id: &str) -> usize {
        self.messages
            .get(channel_id)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Number of membership rows across all channels.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Stored membership row, without going through the async trait.
    #[must_use]
    pub fn member(&self, channel_id: &str, user_id: &str) -> Option<MemberRow> {
        self.members
            .get(&(channel_id.to_string(), user_id.to_string()))
            .map(|row| row.value().clone())
    }

    /// Number of open subscriptions on a channel.
    #[must_use]
    pub fn active_subscriptions(&self, channel_id: &str) -> usize {
        self.subscriptions
            .get(channel_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    fn feed(&self, channel_id: &str) -> broadcast::Sender<Arc<RowChange>> {
        self.feeds
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel_id, "Creating feed");
                broadcast::channel(self.config.channel_capacity).0
            })
            .clone()
    }

    /// Publish a change to live subscriptions. Returns the number of receivers.
    fn publish(&self, change: RowChange) -> usize {
        let channel_id = change.row.channel_id().to_string();
        match self.feeds.get(&channel_id) {
            Some(sender) => {
                let count = sender.send(Arc::new(change)).unwrap_or_default();
                trace!(channel = %channel_id, recipients = count, "Published change");
                count
            }
            None => 0,
        }
    }

    fn validate(&self, row: &NewMessageRow) -> Result<(), StoreError> {
        if row.channel_id.is_empty() {
            return Err(StoreError::Invalid("channel id cannot be empty"));
        }
        if row.sender_id.is_empty() {
            return Err(StoreError::Invalid("sender id cannot be empty"));
        }
        if row.content.trim().is_empty() {
            return Err(StoreError::Invalid("content cannot be empty"));
        }
        if row.content.len() > self.config.max_content_length {
            return Err(StoreError::Invalid("content too long"));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for MemoryBackend {
    async fn fetch_messages(&self, channel_id: &str) -> Result<Vec<MessageRow>, StoreError> {
        let mut rows = self
            .messages
            .get(channel_id)
            .map(|rows| rows.clone())
            .unwrap_or_default();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn insert_message(&self, row: NewMessageRow) -> Result<MessageRow, StoreError> {
        self.validate(&row)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let stored = {
            let mut rows = self.messages.entry(row.channel_id.clone()).or_default();
            // Keep creation times non-decreasing within a channel.
            let created_at = rows
                .last()
                .map_or_else(now_millis, |last| last.created_at.max(now_millis()));
            let stored = row.into_row(id.to_string(), created_at);
            rows.push(stored.clone());
            stored
        };

        debug!(channel = %stored.channel_id, message = %stored.id, "Stored message");
        self.publish(RowChange::insert(Row::Message(stored.clone())));
        Ok(stored)
    }

    async fn fetch_member(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberRow>, StoreError> {
        Ok(self.member(channel_id, user_id))
    }

    async fn upsert_member(&self, row: MemberRow) -> Result<MemberRow, StoreError> {
        if row.channel_id.is_empty() || row.user_id.is_empty() {
            return Err(StoreError::Invalid("membership key cannot be empty"));
        }

        let change = match self
            .members
            .entry((row.channel_id.clone(), row.user_id.clone()))
        {
            Entry::Vacant(entry) => {
                entry.insert(row.clone());
                RowChange::insert(Row::Member(row.clone()))
            }
            Entry::Occupied(mut entry) => {
                if row.last_seen_at < entry.get().last_seen_at {
                    trace!(channel = %row.channel_id, user = %row.user_id, "Keeping newer member row");
                    return Ok(entry.get().clone());
                }
                entry.insert(row.clone());
                RowChange::update(Row::Member(row.clone()))
            }
        };

        self.publish(change);
        Ok(row)
    }

    async fn fetch_online_members(&self, channel_id: &str) -> Result<Vec<MemberRow>, StoreError> {
        let mut rows: Vec<MemberRow> = self
            .members
            .iter()
            .filter(|row| row.channel_id == channel_id && row.online)
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(rows)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
        sink: mpsc::Sender<FeedEvent>,
    ) -> Result<SubscriptionHandle, TransportError> {
        if request.channel_id.is_empty() {
            return Err(TransportError::Other("channel id cannot be empty".into()));
        }

        let mut receiver = self.feed(&request.channel_id).subscribe();
        *self
            .subscriptions
            .entry(request.channel_id.clone())
            .or_insert(0) += 1;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let topic = request.topic.clone();
        let channel_id = request.channel_id.clone();

        debug!(topic = %topic, channel = %channel_id, "Memory subscription opened");

        tokio::spawn(async move {
            if sink
                .send(FeedEvent::Status(SubscriptionStatus::Subscribed))
                .await
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => break,

                    received = receiver.recv() => match received {
                        Ok(change) => {
                            if request.matches(&change)
                                && sink.send(FeedEvent::Change((*change).clone())).await.is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %request.topic, skipped, "Subscription lagged, changes dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = sink.send(FeedEvent::Status(SubscriptionStatus::Closed)).await;
                            break;
                        }
                    },
                }
            }

            trace!(topic = %request.topic, "Memory subscription forwarder stopped");
        });

        let subscriptions = Arc::clone(&self.subscriptions);
        Ok(SubscriptionHandle::new(topic, move || {
            let _ = shutdown_tx.send(());
            if let Some(mut count) = subscriptions.get_mut(&channel_id) {
                *count = count.saturating_sub(1);
            }
            debug!(channel = %channel_id, "Memory subscription closed");
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::{ChangeKind, MemberRole, MessageKind, Table};
    use std::time::Duration;
    use tokio::time::timeout;

    fn new_message(channel: &str, content: &str) -> NewMessageRow {
        NewMessageRow {
            channel_id: channel.into(),
            sender_id: "u-1".into(),
            sender_name: "alice".into(),
            content: content.into(),
            kind: MessageKind::Text,
            correlation_id: Some("temp_1".into()),
        }
    }

    fn request(channel: &str) -> SubscribeRequest {
        SubscribeRequest {
            topic: format!("channel_chat_{channel}"),
            channel_id: channel.into(),
            tables: vec![Table::ChatMessage, Table::ChannelMember],
        }
    }

    async fn next(rx: &mut mpsc::Receiver<FeedEvent>) -> FeedEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("feed event")
            .expect("open feed")
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_echoes_correlation() {
        let backend = MemoryBackend::new();

        let first = backend.insert_message(new_message("ws-1", "a")).await.unwrap();
        let second = backend.insert_message(new_message("ws-1", "b")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert!(second.created_at >= first.created_at);
        assert_eq!(first.correlation_id.as_deref(), Some("temp_1"));

        let history = backend.fetch_messages("ws-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "a");
    }

    #[tokio::test]
    async fn test_insert_rejects_blank_content() {
        let backend = MemoryBackend::new();
        let err = backend
            .insert_message(new_message("ws-1", "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(backend.message_count("ws-1"), 0);
    }

    #[tokio::test]
    async fn test_subscription_receives_scoped_changes() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = backend.subscribe(request("ws-1"), tx).await.unwrap();

        assert_eq!(next(&mut rx).await, FeedEvent::Status(SubscriptionStatus::Subscribed));

        backend.insert_message(new_message("ws-2", "elsewhere")).await.unwrap();
        let stored = backend.insert_message(new_message("ws-1", "here")).await.unwrap();

        match next(&mut rx).await {
            FeedEvent::Change(change) => {
                assert_eq!(change.kind, ChangeKind::Insert);
                assert_eq!(change.row, Row::Message(stored));
            }
            other => panic!("Expected change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = mpsc::channel(16);
        let mut handle = backend.subscribe(request("ws-1"), tx).await.unwrap();
        assert_eq!(backend.active_subscriptions("ws-1"), 1);
        next(&mut rx).await;

        assert!(handle.close());
        assert!(!handle.close());
        assert_eq!(backend.active_subscriptions("ws-1"), 0);

        // The forwarder exits and drops its sender.
        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_member_upsert_last_write_wins() {
        let backend = MemoryBackend::new();
        let row = |online: bool, last_seen_at: u64| MemberRow {
            channel_id: "ws-1".into(),
            user_id: "u-1".into(),
            role: MemberRole::Member,
            online,
            last_seen_at,
        };

        backend.upsert_member(row(true, 200)).await.unwrap();
        let kept = backend.upsert_member(row(false, 100)).await.unwrap();
        assert!(kept.online);

        backend.upsert_member(row(false, 300)).await.unwrap();
        assert!(!backend.member("ws-1", "u-1").unwrap().online);
        assert_eq!(backend.member_count(), 1);
        assert!(backend.fetch_online_members("ws-1").await.unwrap().is_empty());
    }
}
