//! Connection handlers for the Huddle relay.
//!
//! Each WebSocket connection gets its own loop that serves store requests
//! against the shared in-memory backend and forwards feed changes for the
//! topics it subscribed to.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{bail, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, codes, Frame, PROTOCOL_VERSION};
use huddle_transport::{
    ChangeFeed, DataStore, FeedEvent, MemoryBackend, MemoryConfig, StoreError, SubscribeRequest,
    SubscriptionHandle, SubscriptionStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Buffer between the backend and a subscription's forwarder.
const FEED_BUFFER: usize = 256;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Shared relay state.
pub struct AppState {
    /// Store and change feed shared by every connection.
    pub backend: Arc<MemoryBackend>,
    /// Relay configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let backend = MemoryBackend::with_config(MemoryConfig {
            channel_capacity: config.limits.channel_capacity,
            max_content_length: config.limits.max_content_length,
        });

        Self {
            backend: Arc::new(backend),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket relay.
///
/// # Errors
///
/// Returns an error if the relay fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Huddle relay listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, Arc::new(AppState::new(config))).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// An open feed subscription of one connection.
struct Subscription {
    topic: String,
    handle: SubscriptionHandle,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    fn close(mut self) {
        self.handle.close();
        self.forwarder.abort();
    }
}

/// Per-connection state.
struct Connection {
    id: String,
    state: Arc<AppState>,
    subscriptions: HashMap<u64, Subscription>,
    /// Frames produced by subscription forwarders.
    outbound: mpsc::UnboundedSender<Frame>,
}

type WsSender = SplitSink<WebSocket, Message>;

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = format!(
        "conn_{:x}",
        CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(&connection_id, PROTOCOL_VERSION.major, heartbeat);
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }

    let mut read_buffer = BytesMut::with_capacity(4096);
    let (outbound, mut feed_rx) = mpsc::unbounded_channel::<Frame>();
    let mut connection = Connection {
        id: connection_id,
        state,
        subscriptions: HashMap::new(),
        outbound,
    };

    loop {
        tokio::select! {
            biased;

            // Feed changes for this connection's subscriptions
            Some(frame) = feed_rx.recv() => {
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    // Treat text as binary
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection.id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection.id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection.id, "WebSocket stream ended");
                        break;
                    }
                };

                let start = Instant::now();
                metrics::record_frame(data.len(), "inbound");
                read_buffer.extend_from_slice(&data);

                if let Err(e) = connection.drain(&mut read_buffer, &mut sender).await {
                    warn!(connection = %connection.id, error = %e, "Closing connection");
                    break;
                }
                metrics::record_latency(start.elapsed().as_secs_f64());
            }
        }
    }

    connection.close_all();
    debug!(connection = %connection.id, "WebSocket disconnected");
}

impl Connection {
    /// Decode and handle every complete frame in `buf`.
    async fn drain(&mut self, buf: &mut BytesMut, sender: &mut WsSender) -> Result<()> {
        loop {
            match codec::decode_from(buf) {
                Ok(Some(frame)) => self.handle_frame(frame, sender).await?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Invalid frame");
                    metrics::record_error("decode");
                    buf.clear();
                    send_frame(sender, &Frame::error(0, codes::INVALID_FRAME, e.to_string()))
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    /// Handle a decoded frame.
    async fn handle_frame(&mut self, frame: Frame, sender: &mut WsSender) -> Result<()> {
        let backend = Arc::clone(&self.state.backend);

        let response = match frame {
            Frame::Connect { version, token } => {
                debug!(
                    connection = %self.id,
                    version = version,
                    has_token = token.is_some(),
                    "Connect frame"
                );
                if !PROTOCOL_VERSION.accepts_major(version) {
                    let reason = format!("Unsupported protocol version {version}");
                    send_frame(sender, &Frame::error(0, codes::INVALID_FRAME, &reason)).await?;
                    bail!(reason);
                }
                return Ok(());
            }

            Frame::Subscribe {
                id,
                topic,
                channel_id,
                tables,
            } => {
                self.subscribe(id, SubscribeRequest {
                    topic,
                    channel_id,
                    tables,
                })
                .await
            }

            Frame::Unsubscribe { id, topic } => match self.subscriptions.remove(&id) {
                Some(subscription) => {
                    debug!(connection = %self.id, topic = %subscription.topic, "Unsubscribe request");
                    subscription.close();
                    metrics::record_unsubscription(1);
                    Frame::ack(id)
                }
                None => Frame::error(id, codes::NOT_SUBSCRIBED, format!("Not subscribed: {topic}")),
            },

            Frame::FetchMessages { id, channel_id } => store_response(
                id,
                "fetch_messages",
                backend.fetch_messages(&channel_id).await,
                |rows| Frame::Messages { id, rows },
            ),

            Frame::InsertMessage { id, row } => store_response(
                id,
                "insert_message",
                backend.insert_message(row).await,
                |row| Frame::MessageInserted { id, row },
            ),

            Frame::FetchMember {
                id,
                channel_id,
                user_id,
            } => store_response(
                id,
                "fetch_member",
                backend.fetch_member(&channel_id, &user_id).await,
                |row| Frame::Member { id, row },
            ),

            Frame::UpsertMember { id, row } => store_response(
                id,
                "upsert_member",
                backend.upsert_member(row).await,
                |row| Frame::MemberUpserted { id, row },
            ),

            Frame::FetchOnlineMembers { id, channel_id } => store_response(
                id,
                "fetch_online_members",
                backend.fetch_online_members(&channel_id).await,
                |rows| Frame::Members { id, rows },
            ),

            Frame::Ping { timestamp } => Frame::pong(timestamp),

            Frame::Pong { .. } => return Ok(()),

            other => {
                warn!(connection = %self.id, frame_type = other.frame_type().as_str(), "Unexpected frame type");
                match other.request_id() {
                    Some(id) => Frame::error(id, codes::INVALID_FRAME, "Unexpected frame type"),
                    None => return Ok(()),
                }
            }
        };

        send_frame(sender, &response).await
    }

    async fn subscribe(&mut self, id: u64, request: SubscribeRequest) -> Frame {
        debug!(connection = %self.id, topic = %request.topic, "Subscribe request");

        // A topic is subscribed at most once per connection.
        let existing = self
            .subscriptions
            .iter()
            .find(|(_, s)| s.topic == request.topic)
            .map(|(id, _)| *id);
        if let Some(previous) = existing.and_then(|id| self.subscriptions.remove(&id)) {
            previous.close();
            metrics::record_unsubscription(1);
        }

        let limit = self.state.config.limits.max_subscriptions_per_connection;
        if self.subscriptions.len() >= limit {
            warn!(connection = %self.id, limit, "Subscription limit reached");
            return Frame::error(id, codes::SUBSCRIBE_FAILED, "Subscription limit reached");
        }

        let topic = request.topic.clone();
        let (sink, events) = mpsc::channel(FEED_BUFFER);
        match self.state.backend.subscribe(request, sink).await {
            Ok(handle) => {
                let forwarder = tokio::spawn(forward(id, topic.clone(), events, self.outbound.clone()));
                self.subscriptions.insert(
                    id,
                    Subscription {
                        topic,
                        handle,
                        forwarder,
                    },
                );
                metrics::record_subscription();
                Frame::ack(id)
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Subscribe failed");
                metrics::record_error("subscribe");
                Frame::error(id, codes::SUBSCRIBE_FAILED, e.to_string())
            }
        }
    }

    fn close_all(&mut self) {
        let count = self.subscriptions.len();
        for (_, subscription) in self.subscriptions.drain() {
            subscription.close();
        }
        if count > 0 {
            metrics::record_unsubscription(count);
        }
    }
}

/// Turn backend feed events into `Change` frames for one subscription.
async fn forward(
    id: u64,
    topic: String,
    mut events: mpsc::Receiver<FeedEvent>,
    outbound: mpsc::UnboundedSender<Frame>,
) {
    while let Some(event) = events.recv().await {
        let frame = match event {
            FeedEvent::Change(change) => Frame::change(topic.clone(), change),
            // Acknowledged when the subscribe request was answered.
            FeedEvent::Status(SubscriptionStatus::Subscribed) => continue,
            FeedEvent::Status(SubscriptionStatus::ChannelError(reason)) => {
                Frame::error(id, codes::SUBSCRIBE_FAILED, reason)
            }
            FeedEvent::Status(_) => break,
        };
        if outbound.send(frame).is_err() {
            break;
        }
    }
}

fn store_response<T>(
    id: u64,
    operation: &'static str,
    result: Result<T, StoreError>,
    ok: impl FnOnce(T) -> Frame,
) -> Frame {
    metrics::record_store_operation(operation);
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            debug!(operation, error = %e, "Store request rejected");
            metrics::record_error("store");
            Frame::error(id, codes::STORE_REJECTED, e.to_string())
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
