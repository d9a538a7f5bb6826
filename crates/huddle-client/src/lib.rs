//! # huddle-client
//!
//! Client-side sync engine for Huddle channels.
//!
//! A [`SyncController`] keeps one channel's message log and member roster
//! consistent while the user sends messages optimistically and the store
//! pushes changes back over a change feed. Sends render immediately and are
//! reconciled in place when the store confirms them, whether the write
//! response or the feed echo arrives first.
//!
//! ```rust,ignore
//! use huddle_client::{ChatClient, CurrentUser, SessionContext, SyncConfig, SyncController};
//! use huddle_transport::MemoryBackend;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let session = SessionContext::signed_in(CurrentUser::new("u-1"));
//! let controller = SyncController::new(backend.clone(), backend, SyncConfig::default());
//! let client = ChatClient::spawn(controller, Arc::new(session));
//!
//! client.start("general").await?;
//! client.send("hello").await?;
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod subscriber;

pub use client::ChatClient;
pub use config::SyncConfig;
pub use controller::{ChatView, Lifecycle, SyncController};
pub use error::{ClientError, SyncError};
pub use identity::{CurrentUser, IdentityProvider, SessionContext};
pub use subscriber::{
    dispatch, topic_for, ChangeFeedSubscriber, ChannelEvent, Envelope, FeedHandler, SyncEvent,
};
