//! The sync controller: the one component the UI talks to.
//!
//! All mutation of the log and the roster happens on the controller, one
//! event at a time. Feed events and write completions are queued on a
//! bounded channel and applied by [`SyncController::process_next`] or
//! [`SyncController::process_pending`]; the current state is published as a
//! [`ChatView`] on a watch channel.
//!
//! Every `start` and `stop` bumps a generation counter. Queued events carry
//! the generation they were produced under and are dropped if it is stale.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::identity::{CurrentUser, IdentityProvider};
use crate::metrics;
use crate::subscriber::{dispatch, ChangeFeedSubscriber, Envelope, FeedHandler, SyncEvent};
use huddle_core::{
    generate_temp_id, ConnectionSignal, ConnectionState, ConnectionStateMachine, Membership,
    Message, MessageId, MessageLog, PresenceRegistry,
};
use huddle_protocol::{MemberRole, MemberRow, MessageRow};
use huddle_transport::{ChangeFeed, DataStore, StoreError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Terminating,
    Terminated,
}

impl Lifecycle {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Initializing => "initializing",
            Lifecycle::Ready => "ready",
            Lifecycle::Terminating => "terminating",
            Lifecycle::Terminated => "terminated",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a channel as the UI renders it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatView {
    pub channel_id: Option<String>,
    pub messages: Vec<Message>,
    pub online_members: Vec<Membership>,
    pub loading: bool,
    pub error: Option<String>,
    pub connection_state: ConnectionState,
}

/// A surfaced error. Only write errors are cleared by a later successful write.
#[derive(Debug, Clone)]
enum Fault {
    Fetch(String),
    Write(String),
}

impl Fault {
    fn message(&self) -> &str {
        match self {
            Fault::Fetch(message) | Fault::Write(message) => message,
        }
    }
}

/// Channel and user of the running session.
#[derive(Debug, Clone)]
struct Session {
    channel_id: String,
    user: CurrentUser,
}

/// Applies feed events to the log, the roster and the connection state.
struct ChannelState<'a> {
    log: &'a mut MessageLog,
    presence: &'a PresenceRegistry,
    connection: &'a mut ConnectionStateMachine,
}

impl FeedHandler for ChannelState<'_> {
    fn on_message_insert(&mut self, row: MessageRow) {
        let outcome = self.log.reconcile(Message::from(row));
        metrics::record_reconciliation("feed", outcome);
    }

    fn on_membership_change(&mut self, row: MemberRow) {
        self.presence.apply(Membership::from(row));
    }

    fn on_connection_signal(&mut self, signal: ConnectionSignal) {
        if let Some(transition) = self.connection.apply(signal) {
            metrics::record_transition(transition.to);
        }
    }
}

/// Keeps one channel's messages and roster in sync with the store.
pub struct SyncController {
    store: Arc<dyn DataStore>,
    subscriber: ChangeFeedSubscriber,
    presence: Arc<PresenceRegistry>,
    config: SyncConfig,
    log: MessageLog,
    connection: ConnectionStateMachine,
    lifecycle: Lifecycle,
    generation: u64,
    session: Option<Session>,
    loading: bool,
    fault: Option<Fault>,
    events_tx: mpsc::Sender<Envelope>,
    events_rx: mpsc::Receiver<Envelope>,
    view: watch::Sender<ChatView>,
}

impl SyncController {
    /// Create a controller with its own presence registry.
    #[must_use]
    pub fn new(store: Arc<dyn DataStore>, feed: Arc<dyn ChangeFeed>, config: SyncConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (view, _) = watch::channel(ChatView::default());
        Self {
            store,
            subscriber: ChangeFeedSubscriber::new(
                feed,
                config.subscribe_timeout(),
                config.feed_buffer,
            ),
            presence: Arc::new(PresenceRegistry::new()),
            config,
            log: MessageLog::new(),
            connection: ConnectionStateMachine::new(),
            lifecycle: Lifecycle::Uninitialized,
            generation: 0,
            session: None,
            loading: false,
            fault: None,
            events_tx,
            events_rx,
            view,
        }
    }

    /// Share a presence registry with other controllers.
    #[must_use]
    pub fn with_presence(mut self, presence: Arc<PresenceRegistry>) -> Self {
        self.presence = presence;
        self
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn channel_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.channel_id.as_str())
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    /// Latest published view.
    #[must_use]
    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    #[must_use]
    pub fn watch_view(&self) -> watch::Receiver<ChatView> {
        self.view.subscribe()
    }

    /// Start syncing `channel_id` as the identity's current user.
    ///
    /// A running session is stopped first. On success the controller is
    /// `Ready`; a failed history fetch is reported through the view, and a
    /// failed subscribe through the connection state.
    ///
    /// # Errors
    ///
    /// - [`SyncError::AlreadyInitializing`] while another start is running
    /// - [`SyncError::Config`] if the channel id or user id is missing; nothing changes
    pub async fn start(
        &mut self,
        channel_id: &str,
        identity: &dyn IdentityProvider,
    ) -> Result<(), SyncError> {
        if self.lifecycle == Lifecycle::Initializing {
            warn!(channel = %channel_id, "Start ignored: already initializing");
            return Err(SyncError::AlreadyInitializing);
        }

        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            warn!("Start deferred: no channel id");
            return Err(SyncError::Config("channel id"));
        }
        let user = match identity.current_user() {
            Some(user) if !user.id.trim().is_empty() => user,
            _ => {
                warn!(channel = %channel_id, "Start deferred: no signed-in user");
                return Err(SyncError::Config("user id"));
            }
        };

        if self.session.is_some() {
            self.stop();
        }

        self.generation += 1;
        let generation = self.generation;
        info!(channel = %channel_id, user = %user.id, generation, "Starting channel sync");

        self.lifecycle = Lifecycle::Initializing;
        self.log.clear();
        self.connection.apply(ConnectionSignal::Reset);
        self.loading = true;
        self.fault = None;
        self.session = Some(Session {
            channel_id: channel_id.to_string(),
            user: user.clone(),
        });
        self.publish();

        ensure_membership(
            self.store.as_ref(),
            &self.presence,
            self.config.default_role,
            channel_id,
            &user,
        )
        .await;

        // Subscribe before reading history: rows written in between arrive
        // through the queue, and rows seen twice are dropped by id.
        if let Some(transition) = self.connection.apply(ConnectionSignal::Subscribe) {
            metrics::record_transition(transition.to);
        }
        if let Err(e) = self
            .subscriber
            .open(channel_id, generation, self.events_tx.clone())
            .await
        {
            warn!(channel = %channel_id, error = %e, "Failed to subscribe to channel feed");
            if let Some(transition) = self
                .connection
                .apply(ConnectionSignal::TransportError(e.to_string()))
            {
                metrics::record_transition(transition.to);
            }
        }

        if let Err(e) = self.bootstrap(channel_id).await {
            warn!(channel = %channel_id, error = %e, "Failed to load channel history");
            self.fault = Some(Fault::Fetch(format!("Failed to load messages: {e}")));
        }
        self.loading = false;

        self.lifecycle = Lifecycle::Ready;
        self.publish();
        Ok(())
    }

    /// Send a message optimistically. Returns the temporary id.
    ///
    /// The entry shows up in the view immediately; the durable write runs
    /// in the background and its outcome is applied as a queued event.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotReady`] unless the controller is `Ready`
    /// - [`SyncError::EmptyMessage`] for empty or whitespace-only content
    /// - [`SyncError::NoRuntime`] outside a Tokio runtime; nothing is appended
    pub fn send(&mut self, content: &str) -> Result<MessageId, SyncError> {
        let session = match (&self.session, self.lifecycle) {
            (Some(session), Lifecycle::Ready) => session,
            _ => return Err(SyncError::NotReady(self.lifecycle)),
        };
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(channel = %session.channel_id, "Send refused: no runtime for the write");
            return Err(SyncError::NoRuntime);
        };

        let handle = generate_temp_id();
        let message = Message::optimistic(
            handle.clone(),
            &session.channel_id,
            &session.user.id,
            session.user.display_label(),
            content,
        );
        let row = message.to_insert();
        self.log.append(message);
        metrics::record_send();
        debug!(message = %handle, "Sending message");

        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        let generation = self.generation;
        let pending = handle.clone();
        runtime.spawn(async move {
            let result = store.insert_message(row).await;
            let completed = Envelope {
                generation,
                event: SyncEvent::WriteCompleted {
                    handle: pending,
                    result,
                },
            };
            if events.send(completed).await.is_err() {
                trace!("Controller gone before write completed");
            }
        });

        self.publish();
        Ok(handle)
    }

    /// Stop syncing. Synchronous and idempotent.
    ///
    /// Messages still waiting on their write are dropped from the log; a
    /// write that lands anyway shows up in the history of the next start.
    ///
    /// The user is marked offline locally right away. The remote offline
    /// write is spawned on the current runtime and not awaited: if the
    /// process exits first, peers keep seeing the user online until the
    /// next membership change.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            trace!(lifecycle = %self.lifecycle, "Stop ignored: no session");
            return;
        };

        self.lifecycle = Lifecycle::Terminating;
        self.generation += 1;
        info!(channel = %session.channel_id, generation = self.generation, "Stopping channel sync");

        if let Some(member) = self.presence.mark_offline(&session.channel_id, &session.user.id) {
            self.persist_offline(member.to_row());
        }

        self.subscriber.close();
        // Their write completions are stale from here on.
        let unsent = self.log.drop_pending();
        if unsent > 0 {
            debug!(channel = %session.channel_id, unsent, "Dropped unconfirmed messages");
        }
        if let Some(transition) = self.connection.apply(ConnectionSignal::Reset) {
            metrics::record_transition(transition.to);
        }
        self.loading = false;
        self.lifecycle = Lifecycle::Terminated;
        self.publish();
    }

    /// Wait for the next queued event and apply it.
    ///
    /// Returns `false` if the event was stale and dropped. Cancel safe.
    pub async fn process_next(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(envelope) => self.handle(envelope),
            None => false,
        }
    }

    /// Apply every event already queued. Returns how many were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(envelope) = self.events_rx.try_recv() {
            if self.handle(envelope) {
                applied += 1;
            }
        }
        applied
    }

    fn handle(&mut self, envelope: Envelope) -> bool {
        if envelope.generation != self.generation {
            debug!(
                event_generation = envelope.generation,
                generation = self.generation,
                "Dropping stale event"
            );
            metrics::record_stale_event();
            return false;
        }

        match envelope.event {
            SyncEvent::Channel(event) => {
                let mut state = ChannelState {
                    log: &mut self.log,
                    presence: &self.presence,
                    connection: &mut self.connection,
                };
                dispatch(event, &mut state);
            }
            SyncEvent::WriteCompleted { handle, result } => self.complete_write(&handle, result),
        }

        self.publish();
        true
    }

    fn complete_write(&mut self, handle: &str, result: Result<MessageRow, StoreError>) {
        match result {
            Ok(row) => {
                let outcome = self.log.resolve(handle, Message::from(row));
                metrics::record_reconciliation("write", outcome);
                if matches!(self.fault, Some(Fault::Write(_))) {
                    self.fault = None;
                }
            }
            Err(e) => {
                warn!(message = %handle, error = %e, "Failed to send message");
                metrics::record_write_failure();
                self.log.remove_optimistic(handle);
                self.fault = Some(Fault::Write(format!("Failed to send message: {e}")));
            }
        }
    }

    /// Load history and the online roster. Nothing is applied unless both succeed.
    async fn bootstrap(&mut self, channel_id: &str) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let (history, online) = tokio::try_join!(
            store.fetch_messages(channel_id),
            store.fetch_online_members(channel_id)
        )?;

        let loaded = self
            .log
            .load_history(history.into_iter().map(Message::from).collect());
        for row in online {
            self.presence.apply(Membership::from(row));
        }
        debug!(channel = %channel_id, messages = loaded, "Loaded channel history");
        Ok(())
    }

    fn persist_offline(&self, row: MemberRow) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = Arc::clone(&self.store);
                runtime.spawn(async move {
                    if let Err(e) = store.upsert_member(row).await {
                        warn!(error = %e, "Presence: failed to persist offline status");
                        metrics::record_presence_error("write");
                    }
                });
            }
            Err(_) => {
                warn!(channel = %row.channel_id, user = %row.user_id, "Presence: no runtime, offline status not persisted");
            }
        }
    }

    fn publish(&self) {
        let online_members = self
            .session
            .as_ref()
            .map(|s| self.presence.online_members(&s.channel_id))
            .unwrap_or_default();
        self.view.send_replace(ChatView {
            channel_id: self.session.as_ref().map(|s| s.channel_id.clone()),
            messages: self.log.messages().to_vec(),
            online_members,
            loading: self.loading,
            error: self.fault.as_ref().map(|f| f.message().to_string()),
            connection_state: self.connection.state(),
        });
    }
}

/// Make sure the user has an online membership row, locally and in the store.
///
/// Failures are logged and otherwise ignored.
async fn ensure_membership(
    store: &dyn DataStore,
    presence: &PresenceRegistry,
    role: MemberRole,
    channel_id: &str,
    user: &CurrentUser,
) {
    let local = presence.upsert(channel_id, &user.id, role);

    let row = match store.fetch_member(channel_id, &user.id).await {
        Ok(Some(existing)) => MemberRow {
            online: true,
            last_seen_at: existing.last_seen_at.max(local.last_seen_at),
            ..existing
        },
        Ok(None) => local.to_row(),
        Err(e) => {
            warn!(channel = %channel_id, user = %user.id, error = %e, "Presence: failed to read membership");
            metrics::record_presence_error("read");
            local.to_row()
        }
    };

    match store.upsert_member(row).await {
        Ok(stored) => {
            presence.apply(Membership::from(stored));
        }
        Err(e) => {
            warn!(channel = %channel_id, user = %user.id, error = %e, "Presence: failed to write membership");
            metrics::record_presence_error("write");
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.stop();
    }
}
