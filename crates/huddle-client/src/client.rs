//! Task handle the UI layer holds.
//!
//! [`ChatClient`] runs a [`SyncController`] on its own task and talks to it
//! over a command channel, so the UI never blocks on the store or the feed.
//! It also follows the identity provider: signing out stops the session,
//! and signing in resumes a start that was deferred for lack of a user.

use crate::controller::{ChatView, SyncController};
use crate::error::{ClientError, SyncError};
use crate::identity::IdentityProvider;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Command channel capacity.
const COMMAND_BUFFER: usize = 64;

enum Command {
    Start {
        channel_id: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Send {
        content: String,
    },
    Stop,
    Shutdown,
}

/// Handle to a controller running on its own task.
pub struct ChatClient {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ChatView>,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Move `controller` onto a new task.
    #[must_use]
    pub fn spawn(controller: SyncController, identity: Arc<dyn IdentityProvider>) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let view = controller.watch_view();
        let task = tokio::spawn(run(controller, identity, command_rx));
        Self {
            commands,
            view,
            task,
        }
    }

    /// Start syncing a channel.
    ///
    /// # Errors
    ///
    /// Returns the controller's error, or [`ClientError::Stopped`] if the
    /// task is gone. A [`SyncError::Config`] for a missing user means the
    /// start is retried on the next sign-in.
    pub async fn start(&self, channel_id: impl Into<String>) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Start {
            channel_id: channel_id.into(),
            reply,
        })
        .await?;
        response.await.map_err(|_| ClientError::Stopped)??;
        Ok(())
    }

    /// Queue a message. Rejections (empty content, not ready) are logged.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Stopped`] if the task is gone.
    pub async fn send(&self, content: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::Send {
            content: content.into(),
        })
        .await
    }

    /// Stop the current session. The task keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Stopped`] if the task is gone.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.command(Command::Stop).await
    }

    /// Stop the session and end the task.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Stopped`] if the task had already ended.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        self.command(Command::Shutdown).await?;
        self.task.await.map_err(|_| ClientError::Stopped)
    }

    /// Latest view.
    #[must_use]
    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    #[must_use]
    pub fn subscribe_view(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

async fn run(
    mut controller: SyncController,
    identity: Arc<dyn IdentityProvider>,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut auth = identity.watch_user();
    let mut auth_open = true;
    let mut deferred: Option<String> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start { channel_id, reply }) => {
                    let result = controller.start(&channel_id, identity.as_ref()).await;
                    deferred = match result {
                        Err(SyncError::Config("user id")) => Some(channel_id),
                        _ => None,
                    };
                    let _ = reply.send(result);
                }
                Some(Command::Send { content }) => {
                    if let Err(e) = controller.send(&content) {
                        debug!(error = %e, "Send rejected");
                    }
                }
                Some(Command::Stop) => {
                    deferred = None;
                    controller.stop();
                }
                Some(Command::Shutdown) | None => break,
            },

            changed = auth.changed(), if auth_open => {
                if changed.is_err() {
                    auth_open = false;
                    continue;
                }
                let signed_in = auth.borrow_and_update().is_some();
                if !signed_in {
                    if controller.channel_id().is_some() {
                        info!("Signed out, stopping channel sync");
                        controller.stop();
                    }
                } else if let Some(channel_id) = deferred.take() {
                    info!(channel = %channel_id, "Signed in, resuming deferred start");
                    if let Err(e) = controller.start(&channel_id, identity.as_ref()).await {
                        debug!(channel = %channel_id, error = %e, "Deferred start failed");
                    }
                }
            }

            _ = controller.process_next() => {}
        }
    }

    controller.stop();
    debug!("Chat client task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::identity::{CurrentUser, SessionContext};
    use huddle_core::ConnectionState;
    use huddle_transport::MemoryBackend;
    use std::time::Duration;

    fn client(backend: &Arc<MemoryBackend>, session: &SessionContext) -> ChatClient {
        let controller =
            SyncController::new(backend.clone(), backend.clone(), SyncConfig::default());
        ChatClient::spawn(controller, Arc::new(session.clone()))
    }

    async fn wait_until(view: &mut watch::Receiver<ChatView>, ready: impl Fn(&ChatView) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if ready(&view.borrow_and_update()) {
                    return;
                }
                view.changed().await.unwrap();
            }
        })
        .await
        .expect("view never reached the expected state");
    }

    #[tokio::test]
    async fn test_client_send_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let session = SessionContext::signed_in(CurrentUser::new("u-1").with_email("dee@example.com"));
        let client = client(&backend, &session);
        let mut view = client.subscribe_view();

        client.start("ws-1").await.unwrap();
        wait_until(&mut view, |v| v.connection_state == ConnectionState::Subscribed).await;

        client.send("hello").await.unwrap();
        wait_until(&mut view, |v| {
            v.messages.len() == 1 && !v.messages[0].optimistic
        })
        .await;
        assert_eq!(client.view().messages[0].sender_name, "dee");

        client.shutdown().await.unwrap();
        // The offline write is fire-and-forget.
        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.member("ws-1", "u-1").map_or(true, |m| m.online) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_deferred_until_sign_in() {
        let backend = Arc::new(MemoryBackend::new());
        let session = SessionContext::new();
        let client = client(&backend, &session);
        let mut view = client.subscribe_view();

        let err = client.start("ws-1").await.unwrap_err();
        assert!(matches!(err, ClientError::Sync(SyncError::Config("user id"))));

        session.sign_in(CurrentUser::new("u-1"));
        wait_until(&mut view, |v| v.channel_id.as_deref() == Some("ws-1")).await;
        assert!(backend.member("ws-1", "u-1").is_some());
    }

    #[tokio::test]
    async fn test_sign_out_stops_session() {
        let backend = Arc::new(MemoryBackend::new());
        let session = SessionContext::signed_in(CurrentUser::new("u-1"));
        let client = client(&backend, &session);
        let mut view = client.subscribe_view();

        client.start("ws-1").await.unwrap();
        session.sign_out();

        wait_until(&mut view, |v| {
            v.channel_id.is_none() && v.connection_state == ConnectionState::Idle
        })
        .await;
        assert_eq!(backend.active_subscriptions("ws-1"), 0);
    }
}
