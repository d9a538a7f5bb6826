//! # huddle-protocol
//!
//! Wire definitions shared by Huddle clients and the development relay.
//!
//! - **Rows** - message and membership rows plus row-change notifications
//! - **Frames** - store requests/responses and change-feed traffic
//! - **Codec** - length-prefixed MessagePack framing
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Frame};
//!
//! let frame = Frame::ack(7);
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;
pub mod rows;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType};
pub use rows::{
    ChangeKind, MemberRole, MemberRow, MessageKind, MessageRow, NewMessageRow, Row, RowChange,
    Table,
};
pub use version::{Version, PROTOCOL_VERSION};
