//! # huddle-core
//!
//! Data structures behind the Huddle chat synchronization engine.
//!
//! - **MessageLog** - ordered messages for one channel, merging optimistic
//!   and confirmed entries without duplication or reordering
//! - **PresenceRegistry** - membership roster with online flag and last-seen time
//! - **ConnectionStateMachine** - health of the change-feed subscription
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ Change feed │────▶│ SyncController │────▶│    MessageLog    │
//! └─────────────┘     └────────────────┘     └──────────────────┘
//!                             │      │
//!                             ▼      ▼
//!               ┌──────────────┐   ┌────────────────────────┐
//!               │   Presence   │   │ ConnectionStateMachine │
//!               └──────────────┘   └────────────────────────┘
//! ```
//!
//! None of these types perform I/O; the controller in `huddle-client`
//! serializes every mutation.

pub mod connection;
pub mod message;
pub mod message_log;
pub mod presence;

pub use connection::{ConnectionSignal, ConnectionState, ConnectionStateMachine, Transition};
pub use huddle_protocol::{MemberRole, MessageKind};
pub use message::{generate_temp_id, now_millis, Message, MessageId};
pub use message_log::{MessageLog, Reconciliation};
pub use presence::{Membership, PresenceRegistry};
