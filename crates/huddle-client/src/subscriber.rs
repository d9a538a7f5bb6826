//! Change-feed subscription for one channel.
//!
//! The subscriber owns at most one subscription. A pump task turns raw feed
//! events into typed [`ChannelEvent`]s, tags them with the controller's
//! generation and forwards them to the controller's queue in arrival order.
//! It never deduplicates or reorders; the message log does that.

use huddle_core::{ConnectionSignal, MessageId};
use huddle_protocol::{ChangeKind, MemberRow, MessageRow, Row, Table};
use huddle_transport::{
    ChangeFeed, FeedEvent, StoreError, SubscribeRequest, SubscriptionHandle, SubscriptionStatus,
    TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Feed topic for a channel.
#[must_use]
pub fn topic_for(channel_id: &str) -> String {
    format!("channel_chat_{channel_id}")
}

/// A typed event from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    MessageInserted(MessageRow),
    MembershipChanged(MemberRow),
    Connection(ConnectionSignal),
}

/// Anything the controller applies.
#[derive(Debug)]
pub enum SyncEvent {
    Channel(ChannelEvent),
    /// The durable write for optimistic entry `handle` finished.
    WriteCompleted {
        handle: MessageId,
        result: Result<MessageRow, StoreError>,
    },
}

/// An event tagged with the controller generation that produced it.
#[derive(Debug)]
pub struct Envelope {
    pub generation: u64,
    pub event: SyncEvent,
}

impl Envelope {
    #[must_use]
    pub fn channel(generation: u64, event: ChannelEvent) -> Self {
        Self {
            generation,
            event: SyncEvent::Channel(event),
        }
    }
}

/// Receiver of typed channel events.
pub trait FeedHandler {
    fn on_message_insert(&mut self, row: MessageRow);
    fn on_membership_change(&mut self, row: MemberRow);
    fn on_connection_signal(&mut self, signal: ConnectionSignal);
}

/// Route an event to the matching handler method.
pub fn dispatch<H: FeedHandler + ?Sized>(event: ChannelEvent, handler: &mut H) {
    match event {
        ChannelEvent::MessageInserted(row) => handler.on_message_insert(row),
        ChannelEvent::MembershipChanged(row) => handler.on_membership_change(row),
        ChannelEvent::Connection(signal) => handler.on_connection_signal(signal),
    }
}

/// Map a raw feed event. Message updates are dropped.
#[must_use]
pub fn translate(event: FeedEvent) -> Option<ChannelEvent> {
    match event {
        FeedEvent::Change(change) => match (change.kind, change.row) {
            (ChangeKind::Insert, Row::Message(row)) => Some(ChannelEvent::MessageInserted(row)),
            (ChangeKind::Update, Row::Message(row)) => {
                trace!(message = %row.id, "Ignoring message update");
                None
            }
            (_, Row::Member(row)) => Some(ChannelEvent::MembershipChanged(row)),
        },
        FeedEvent::Status(status) => Some(ChannelEvent::Connection(match status {
            SubscriptionStatus::Subscribed => ConnectionSignal::Ack,
            SubscriptionStatus::ChannelError(reason) => ConnectionSignal::TransportError(reason),
            SubscriptionStatus::TimedOut => ConnectionSignal::Timeout,
            SubscriptionStatus::Closed => ConnectionSignal::Close,
        })),
    }
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    pump: JoinHandle<()>,
    generation: u64,
}

/// Opens and closes the channel subscription of one controller.
pub struct ChangeFeedSubscriber {
    feed: Arc<dyn ChangeFeed>,
    subscribe_timeout: Duration,
    buffer: usize,
    active: Option<ActiveSubscription>,
}

impl ChangeFeedSubscriber {
    #[must_use]
    pub fn new(feed: Arc<dyn ChangeFeed>, subscribe_timeout: Duration, buffer: usize) -> Self {
        Self {
            feed,
            subscribe_timeout,
            buffer: buffer.max(1),
            active: None,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Generation of the open subscription.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.active.as_ref().map(|active| active.generation)
    }

    /// Subscribe to `channel_id`, closing any previous subscription first.
    ///
    /// Events are sent to `dispatch` tagged with `generation`. If no
    /// acknowledgment arrives within the subscribe timeout a
    /// [`ConnectionSignal::Timeout`] is sent instead.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the subscription could not be opened.
    pub async fn open(
        &mut self,
        channel_id: &str,
        generation: u64,
        dispatch: mpsc::Sender<Envelope>,
    ) -> Result<(), TransportError> {
        self.close();

        let request = SubscribeRequest {
            topic: topic_for(channel_id),
            channel_id: channel_id.to_string(),
            tables: vec![Table::ChatMessage, Table::ChannelMember],
        };
        let topic = request.topic.clone();
        let (sink, events) = mpsc::channel(self.buffer);
        let handle = self.feed.subscribe(request, sink).await?;

        let pump = tokio::spawn(pump(events, generation, dispatch, self.subscribe_timeout));
        info!(topic = %topic, generation, feed = self.feed.name(), "Subscribed to channel feed");

        self.active = Some(ActiveSubscription {
            handle,
            pump,
            generation,
        });
        Ok(())
    }

    /// Close the subscription. Returns `false` if none was open.
    pub fn close(&mut self) -> bool {
        match self.active.take() {
            Some(mut active) => {
                active.handle.close();
                active.pump.abort();
                debug!(topic = %active.handle.topic(), generation = active.generation, "Closed channel feed");
                true
            }
            None => false,
        }
    }
}

impl Drop for ChangeFeedSubscriber {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(
    mut events: mpsc::Receiver<FeedEvent>,
    generation: u64,
    dispatch: mpsc::Sender<Envelope>,
    subscribe_timeout: Duration,
) {
    let deadline = tokio::time::sleep(subscribe_timeout);
    tokio::pin!(deadline);
    let mut waiting_for_ack = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event == FeedEvent::Status(SubscriptionStatus::Subscribed) {
                    waiting_for_ack = false;
                }
                let Some(event) = translate(event) else { continue };
                if dispatch.send(Envelope::channel(generation, event)).await.is_err() {
                    break;
                }
            }

            () = &mut deadline, if waiting_for_ack => {
                waiting_for_ack = false;
                debug!(generation, "Subscribe not acknowledged in time");
                let timeout = ChannelEvent::Connection(ConnectionSignal::Timeout);
                if dispatch.send(Envelope::channel(generation, timeout)).await.is_err() {
                    break;
                }
            }
        }
    }

    trace!(generation, "Feed pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use huddle_protocol::{MemberRole, MessageKind, RowChange};
    use huddle_transport::MemoryBackend;
    use std::sync::Mutex;

    fn message_row(id: &str) -> MessageRow {
        MessageRow {
            id: id.into(),
            channel_id: "ws-1".into(),
            sender_id: "u-1".into(),
            sender_name: "alice".into(),
            content: "hello".into(),
            kind: MessageKind::Text,
            created_at: 1,
            correlation_id: None,
        }
    }

    /// Feed that accepts subscriptions and never says anything.
    struct SilentFeed {
        sinks: Mutex<Vec<mpsc::Sender<FeedEvent>>>,
    }

    #[async_trait]
    impl ChangeFeed for SilentFeed {
        async fn subscribe(
            &self,
            request: SubscribeRequest,
            sink: mpsc::Sender<FeedEvent>,
        ) -> Result<SubscriptionHandle, TransportError> {
            self.sinks.lock().unwrap().push(sink);
            Ok(SubscriptionHandle::new(request.topic, || {}))
        }

        fn name(&self) -> &'static str {
            "silent"
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl FeedHandler for Recorder {
        fn on_message_insert(&mut self, row: MessageRow) {
            self.events.push(format!("message:{}", row.id));
        }

        fn on_membership_change(&mut self, row: MemberRow) {
            self.events.push(format!("member:{}", row.user_id));
        }

        fn on_connection_signal(&mut self, signal: ConnectionSignal) {
            self.events.push(format!("signal:{signal:?}"));
        }
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(topic_for("ws-1"), "channel_chat_ws-1");
    }

    #[test]
    fn test_translate_ignores_message_updates() {
        let update = FeedEvent::Change(RowChange::update(Row::Message(message_row("1"))));
        assert!(translate(update).is_none());

        let member = MemberRow {
            channel_id: "ws-1".into(),
            user_id: "u-2".into(),
            role: MemberRole::Member,
            online: false,
            last_seen_at: 3,
        };
        let update = FeedEvent::Change(RowChange::update(Row::Member(member.clone())));
        assert_eq!(translate(update), Some(ChannelEvent::MembershipChanged(member)));

        let closed = FeedEvent::Status(SubscriptionStatus::Closed);
        assert_eq!(
            translate(closed),
            Some(ChannelEvent::Connection(ConnectionSignal::Close))
        );
    }

    #[test]
    fn test_dispatch_routes_by_type() {
        let mut recorder = Recorder::default();
        dispatch(ChannelEvent::Connection(ConnectionSignal::Ack), &mut recorder);
        dispatch(ChannelEvent::MessageInserted(message_row("7")), &mut recorder);

        assert_eq!(recorder.events, vec!["signal:Ack", "message:7"]);
    }

    #[tokio::test]
    async fn test_events_forwarded_in_order_with_generation() {
        let backend = Arc::new(MemoryBackend::new());
        let mut subscriber = ChangeFeedSubscriber::new(backend.clone(), Duration::from_secs(10), 16);
        let (tx, mut rx) = mpsc::channel(16);

        subscriber.open("ws-1", 3, tx).await.unwrap();
        assert!(subscriber.is_open());

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.generation, 3);
        assert!(matches!(
            ack.event,
            SyncEvent::Channel(ChannelEvent::Connection(ConnectionSignal::Ack))
        ));

        use huddle_transport::DataStore;
        for content in ["one", "two"] {
            backend
                .insert_message(huddle_protocol::NewMessageRow {
                    channel_id: "ws-1".into(),
                    sender_id: "u-1".into(),
                    sender_name: "alice".into(),
                    content: content.into(),
                    kind: MessageKind::Text,
                    correlation_id: None,
                })
                .await
                .unwrap();
        }

        let mut contents = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap().event {
                SyncEvent::Channel(ChannelEvent::MessageInserted(row)) => contents.push(row.content),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_subscribe_times_out() {
        let feed = Arc::new(SilentFeed {
            sinks: Mutex::new(Vec::new()),
        });
        let mut subscriber = ChangeFeedSubscriber::new(feed, Duration::from_secs(10), 16);
        let (tx, mut rx) = mpsc::channel(16);

        subscriber.open("ws-1", 1, tx).await.unwrap();

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(
            envelope.event,
            SyncEvent::Channel(ChannelEvent::Connection(ConnectionSignal::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_reopen_closes_previous_subscription() {
        let backend = Arc::new(MemoryBackend::new());
        let mut subscriber = ChangeFeedSubscriber::new(backend.clone(), Duration::from_secs(10), 16);
        let (tx, _rx) = mpsc::channel(16);

        subscriber.open("ws-1", 1, tx.clone()).await.unwrap();
        subscriber.open("ws-2", 2, tx).await.unwrap();

        assert_eq!(subscriber.generation(), Some(2));
        assert_eq!(backend.active_subscriptions("ws-1"), 0);
        assert_eq!(backend.active_subscriptions("ws-2"), 1);

        assert!(subscriber.close());
        assert!(!subscriber.close());
        assert_eq!(backend.active_subscriptions("ws-2"), 0);
    }
}
