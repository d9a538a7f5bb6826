//! Health of the change-feed subscription.
//!
//! The state machine is purely observational: it records what the transport
//! reported and never retries. Retry policy belongs to the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// Subscription health as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Subscribed,
    Error,
    TimedOut,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Error => "error",
            ConnectionState::TimedOut => "timed_out",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// A subscribe request was issued.
    Subscribe,
    /// The transport acknowledged the subscription.
    Ack,
    /// The transport failed.
    TransportError(String),
    /// The subscribe window elapsed without an acknowledgment.
    Timeout,
    /// The subscription was closed.
    Close,
    /// Return to `Idle` (teardown).
    Reset,
}

/// A state change produced by [`ConnectionStateMachine::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Tracks the state of one subscription.
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    last_error: Option<String>,
}

impl ConnectionStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reason reported with the most recent transport error.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Feed a signal. Returns the transition, or `None` if the signal does
    /// not apply in the current state.
    pub fn apply(&mut self, signal: ConnectionSignal) -> Option<Transition> {
        use ConnectionState::*;

        let next = match (&signal, self.state) {
            (ConnectionSignal::Subscribe, Idle | Error | TimedOut | Closed) => Connecting,
            (ConnectionSignal::Ack, Connecting) => Subscribed,
            // Only an unacknowledged subscribe can time out.
            (ConnectionSignal::Timeout, Connecting) => TimedOut,
            (ConnectionSignal::TransportError(_), _) => Error,
            (ConnectionSignal::Close, _) => Closed,
            (ConnectionSignal::Reset, _) => Idle,
            (signal, state) => {
                trace!(?signal, %state, "Ignoring connection signal");
                return None;
            }
        };

        match signal {
            ConnectionSignal::TransportError(reason) => self.last_error = Some(reason),
            ConnectionSignal::Subscribe | ConnectionSignal::Reset => self.last_error = None,
            _ => {}
        }

        let transition = Transition {
            from: self.state,
            to: next,
        };
        self.state = next;
        debug!(from = %transition.from, to = %transition.to, "Connection state changed");
        Some(transition)
    }
}
