//! # huddle-transport
//!
//! Collaborators the Huddle sync engine talks to:
//!
//! - **Memory** - in-process store and feed, used by tests, benches and the relay
//! - **WebSocket** - client for a Huddle relay
//!
//! Both implement [`DataStore`] and [`ChangeFeed`], so the engine does not
//! care which one it is wired to.
//!
//! ```rust,ignore
//! use huddle_transport::{ChangeFeed, SubscribeRequest};
//!
//! async fn watch(feed: &dyn ChangeFeed, request: SubscribeRequest) {
//!     let (sink, mut events) = tokio::sync::mpsc::channel(64);
//!     let _handle = feed.subscribe(request, sink).await.unwrap();
//!     while let Some(event) = events.recv().await {
//!         // Process event
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryBackend, MemoryConfig};
pub use traits::{
    ChangeFeed, DataStore, FeedEvent, StoreError, SubscribeRequest, SubscriptionHandle,
    SubscriptionStatus, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketBackend, WebSocketConfig};
