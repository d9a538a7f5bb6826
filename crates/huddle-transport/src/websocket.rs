//! WebSocket client transport.
//!
//! One connection to a Huddle relay carries both collaborators: store
//! requests are correlated with their responses by request id, and each
//! feed subscription is routed by topic. A single I/O task owns the socket;
//! callers talk to it over a command channel.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, Frame, MemberRow, MessageRow, NewMessageRow, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

use crate::traits::{
    ChangeFeed, DataStore, FeedEvent, StoreError, SubscribeRequest, SubscriptionHandle,
    SubscriptionStatus, TransportError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Relay endpoint, e.g. `ws://127.0.0.1:8080/ws`.
    pub url: String,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
    /// How long to wait for the handshake and for each store response.
    pub request_timeout: Duration,
    /// Optional authentication token sent with `Connect`.
    pub token: Option<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            max_message_size: 64 * 1024, // 64 KB
            request_timeout: Duration::from_secs(10),
            token: None,
        }
    }
}

/// Work handed to the I/O task.
enum Command {
    Request {
        frame: Frame,
        reply: oneshot::Sender<Frame>,
    },
    Subscribe {
        id: u64,
        topic: String,
        frame: Frame,
        sink: mpsc::Sender<FeedEvent>,
    },
    Unsubscribe {
        id: u64,
        topic: String,
    },
    Close,
}

/// Data store and change feed over a WebSocket connection to a relay.
pub struct WebSocketBackend {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    open: Arc<AtomicBool>,
    connection_id: String,
    config: WebSocketConfig,
}

impl WebSocketBackend {
    /// Connect and complete the protocol handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the WebSocket handshake fails, the relay speaks an
    /// incompatible protocol version, or the relay does not answer in time.
    pub async fn connect(config: WebSocketConfig) -> Result<Self, TransportError> {
        let (mut stream, _) = connect_async(config.url.as_str()).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Other(format!("WebSocket handshake failed: {}", e))
        })?;

        let mut read_buffer = BytesMut::with_capacity(4096);
        let greeting = tokio::time::timeout(
            config.request_timeout,
            read_frame(&mut stream, &mut read_buffer),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let connection_id = match greeting {
            Frame::Connected {
                connection_id,
                version,
                ..
            } if PROTOCOL_VERSION.accepts_major(version) => connection_id,
            Frame::Connected { version, .. } => {
                return Err(TransportError::Other(format!(
                    "Relay speaks protocol {version}, client speaks {PROTOCOL_VERSION}"
                )));
            }
            _ => return Err(TransportError::UnexpectedFrame("expected connected")),
        };

        let hello = codec::encode(&Frame::connect(PROTOCOL_VERSION.major, config.token.clone()))?;
        stream
            .send(Message::Binary(hello.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        info!(connection = %connection_id, url = %config.url, "Connected to relay");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        tokio::spawn(run_io(
            stream,
            read_buffer,
            command_rx,
            Arc::clone(&open),
            config.max_message_size,
        ));

        Ok(Self {
            commands,
            next_id: AtomicU64::new(1),
            open,
            connection_id,
            config,
        })
    }

    /// Connection id assigned by the relay.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the connection. Open subscriptions receive `Closed`.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, build: impl FnOnce(u64) -> Frame) -> Result<Frame, TransportError> {
        let (reply, response) = oneshot::channel();
        let frame = build(self.next_request_id());
        self.commands
            .send(Command::Request { frame, reply })
            .map_err(|_| TransportError::ConnectionClosed)?;

        let frame = tokio::time::timeout(self.config.request_timeout, response)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::ConnectionClosed)?;

        match frame {
            Frame::Error { code, message, .. } => Err(TransportError::Rejected { code, message }),
            other => Ok(other),
        }
    }
}

impl Drop for WebSocketBackend {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl DataStore for WebSocketBackend {
    async fn fetch_messages(&self, channel_id: &str) -> Result<Vec<MessageRow>, StoreError> {
        let channel_id = channel_id.to_string();
        match self
            .request(|id| Frame::FetchMessages { id, channel_id })
            .await?
        {
            Frame::Messages { rows, .. } => Ok(rows),
            _ => Err(TransportError::UnexpectedFrame("expected messages").into()),
        }
    }

    async fn insert_message(&self, row: NewMessageRow) -> Result<MessageRow, StoreError> {
        match self.request(|id| Frame::InsertMessage { id, row }).await? {
            Frame::MessageInserted { row, .. } => Ok(row),
            _ => Err(TransportError::UnexpectedFrame("expected message_inserted").into()),
        }
    }

    async fn fetch_member(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberRow>, StoreError> {
        let channel_id = channel_id.to_string();
        let user_id = user_id.to_string();
        match self
            .request(|id| Frame::FetchMember {
                id,
                channel_id,
                user_id,
            })
            .await?
        {
            Frame::Member { row, .. } => Ok(row),
            _ => Err(TransportError::UnexpectedFrame("expected member").into()),
        }
    }

    async fn upsert_member(&self, row: MemberRow) -> Result<MemberRow, StoreError> {
        match self.request(|id| Frame::UpsertMember { id, row }).await? {
            Frame::MemberUpserted { row, .. } => Ok(row),
            _ => Err(TransportError::UnexpectedFrame("expected member_upserted").into()),
        }
    }

    async fn fetch_online_members(&self, channel_id: &str) -> Result<Vec<MemberRow>, StoreError> {
        let channel_id = channel_id.to_string();
        match self
            .request(|id| Frame::FetchOnlineMembers { id, channel_id })
            .await?
        {
            Frame::Members { rows, .. } => Ok(rows),
            _ => Err(TransportError::UnexpectedFrame("expected members").into()),
        }
    }
}

#[async_trait]
impl ChangeFeed for WebSocketBackend {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
        sink: mpsc::Sender<FeedEvent>,
    ) -> Result<SubscriptionHandle, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let id = self.next_request_id();
        let frame = Frame::subscribe(
            id,
            request.topic.clone(),
            request.channel_id.clone(),
            request.tables.clone(),
        );
        self.commands
            .send(Command::Subscribe {
                id,
                topic: request.topic.clone(),
                frame,
                sink,
            })
            .map_err(|_| TransportError::ConnectionClosed)?;

        let commands = self.commands.clone();
        let topic = request.topic;
        Ok(SubscriptionHandle::new(topic.clone(), move || {
            let _ = commands.send(Command::Unsubscribe { id, topic });
        }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Read until one complete frame is buffered.
async fn read_frame(stream: &mut WsStream, buf: &mut BytesMut) -> Result<Frame, TransportError> {
    loop {
        if let Some(frame) = codec::decode_from(buf)? {
            return Ok(frame);
        }
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => buf.extend_from_slice(&data),
            Some(Ok(Message::Text(text))) => buf.extend_from_slice(text.as_bytes()),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }
}

async fn send_frame(
    sender: &mut SplitSink<WsStream, Message>,
    frame: &Frame,
) -> Result<(), TransportError> {
    let data = codec::encode(frame)?;
    sender
        .send(Message::Binary(data.to_vec()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

/// A feed subscription as seen by the I/O task.
struct FeedRoute {
    topic: String,
    sink: mpsc::Sender<FeedEvent>,
    acknowledged: bool,
}

/// Correlation state owned by the I/O task.
#[derive(Default)]
struct Session {
    pending: HashMap<u64, oneshot::Sender<Frame>>,
    subscriptions: HashMap<u64, FeedRoute>,
    topics: HashMap<String, u64>,
}

impl Session {
    /// Route an inbound frame. Returns a frame to send back, if any.
    async fn route(&mut self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Change { topic, change } => {
                let route = self
                    .topics
                    .get(&topic)
                    .and_then(|id| self.subscriptions.get(id));
                match route {
                    Some(route) => {
                        if route.sink.send(FeedEvent::Change(change)).await.is_err() {
                            trace!(topic = %topic, "Feed sink dropped");
                        }
                    }
                    None => trace!(topic = %topic, "Change for unknown topic"),
                }
                None
            }
            Frame::Ack { id } if self.subscriptions.contains_key(&id) => {
                if let Some(route) = self.subscriptions.get_mut(&id) {
                    if !route.acknowledged {
                        route.acknowledged = true;
                        let _ = route
                            .sink
                            .send(FeedEvent::Status(SubscriptionStatus::Subscribed))
                            .await;
                    }
                }
                None
            }
            Frame::Error { id, message, .. } if self.subscriptions.contains_key(&id) => {
                if let Some(route) = self.subscriptions.remove(&id) {
                    self.topics.remove(&route.topic);
                    warn!(topic = %route.topic, reason = %message, "Subscription rejected");
                    let _ = route
                        .sink
                        .send(FeedEvent::Status(SubscriptionStatus::ChannelError(message)))
                        .await;
                }
                None
            }
            Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),
            Frame::Pong { .. } | Frame::Connected { .. } => None,
            other => {
                match other.request_id().and_then(|id| self.pending.remove(&id)) {
                    Some(reply) => {
                        let _ = reply.send(other);
                    }
                    None => trace!(frame_type = other.frame_type().as_str(), "Unmatched frame"),
                }
                None
            }
        }
    }

    /// Decode and route every complete frame in `buf`.
    async fn drain(
        &mut self,
        buf: &mut BytesMut,
        sender: &mut SplitSink<WsStream, Message>,
    ) -> Result<(), TransportError> {
        while let Some(frame) = codec::decode_from(buf)? {
            if let Some(reply) = self.route(frame).await {
                send_frame(sender, &reply).await?;
            }
        }
        Ok(())
    }
}

/// Own the socket until it closes or the backend is dropped.
async fn run_io(
    stream: WsStream,
    mut read_buffer: BytesMut,
    mut commands: mpsc::UnboundedReceiver<Command>,
    open: Arc<AtomicBool>,
    max_message_size: usize,
) {
    let (mut sender, mut receiver) = stream.split();
    let mut session = Session::default();
    let mut failure: Option<String> = None;

    // Frames that arrived together with the greeting.
    if let Err(e) = session.drain(&mut read_buffer, &mut sender).await {
        failure = Some(e.to_string());
    }

    while failure.is_none() {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Request { frame, reply }) => {
                    session.pending.retain(|_, waiting| !waiting.is_closed());
                    if let Some(id) = frame.request_id() {
                        session.pending.insert(id, reply);
                    }
                    if let Err(e) = send_frame(&mut sender, &frame).await {
                        failure = Some(e.to_string());
                    }
                }
                Some(Command::Subscribe { id, topic, frame, sink }) => {
                    debug!(topic = %topic, id, "Subscribing");
                    session.topics.insert(topic.clone(), id);
                    session.subscriptions.insert(id, FeedRoute { topic, sink, acknowledged: false });
                    if let Err(e) = send_frame(&mut sender, &frame).await {
                        failure = Some(e.to_string());
                    }
                }
                Some(Command::Unsubscribe { id, topic }) => {
                    if session.subscriptions.remove(&id).is_some() {
                        if session.topics.get(&topic) == Some(&id) {
                            session.topics.remove(&topic);
                        }
                        debug!(topic = %topic, id, "Unsubscribing");
                        if let Err(e) = send_frame(&mut sender, &Frame::unsubscribe(id, topic)).await {
                            failure = Some(e.to_string());
                        }
                    }
                }
                Some(Command::Close) | None => {
                    let _ = sender.close().await;
                    break;
                }
            },

            message = receiver.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > max_message_size {
                        warn!("Message too large: {} bytes (max: {})", data.len(), max_message_size);
                        failure = Some(format!("message of {} bytes exceeds limit", data.len()));
                        continue;
                    }
                    read_buffer.extend_from_slice(&data);
                    if let Err(e) = session.drain(&mut read_buffer, &mut sender).await {
                        failure = Some(e.to_string());
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    // For compatibility, treat text as binary
                    read_buffer.extend_from_slice(text.as_bytes());
                    if let Err(e) = session.drain(&mut read_buffer, &mut sender).await {
                        failure = Some(e.to_string());
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sender.send(Message::Pong(data)).await {
                        failure = Some(e.to_string());
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("Relay closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    failure = Some(e.to_string());
                }
            },
        }
    }

    open.store(false, Ordering::SeqCst);

    let status = match failure {
        Some(reason) => SubscriptionStatus::ChannelError(reason),
        None => SubscriptionStatus::Closed,
    };
    for route in session.subscriptions.into_values() {
        let _ = route.sink.try_send(FeedEvent::Status(status.clone()));
    }
    // Dropping `session.pending` fails waiting requests with ConnectionClosed.
    debug!("WebSocket I/O task stopped");
}
