//! Leg identities and lifecycle states for a relayed connection pair

use std::fmt;

/// One of the two sockets owned by a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// The accepted inbound socket
    Client,
    /// The socket opened towards the configured target
    Upstream,
}

impl Leg {
    /// The other socket of the pair
    pub fn peer(self) -> Leg {
        match self {
            Leg::Client => Leg::Upstream,
            Leg::Upstream => Leg::Client,
        }
    }

    /// Direction label for frames read from this leg
    pub fn direction(self) -> &'static str {
        match self {
            Leg::Client => "client → target",
            Leg::Upstream => "target → client",
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Client => f.write_str("client"),
            Leg::Upstream => f.write_str("target"),
        }
    }
}

/// Lifecycle of a single leg as seen by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    /// Handshake still in flight (upstream only)
    Connecting,
    Open,
    /// A close frame was sent or received; the closing handshake is running
    Closing,
    Closed,
}

impl LegState {
    pub fn is_open(self) -> bool {
        self == LegState::Open
    }

    /// Closing or already closed
    pub fn is_terminating(self) -> bool {
        matches!(self, LegState::Closing | LegState::Closed)
    }
}
