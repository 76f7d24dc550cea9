//! Events fed into the relay state machine when IO happens on either leg

use crate::connection::Leg;
use crate::websocket::{CloseInfo, Frame};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The upstream handshake completed
    UpstreamConnected,
    /// The upstream handshake failed (unreachable target, rejected credentials, ...)
    UpstreamFailed { error: String },
    /// A data or ping/pong frame arrived on a leg
    FrameReceived { from: Leg, frame: Frame },
    /// The remote end of a leg sent a close frame
    CloseReceived { from: Leg, close: CloseInfo },
    /// A leg's stream ended
    Disconnected { leg: Leg },
    /// A leg reported a transport error. Terminal errors end the leg.
    Errored { leg: Leg, error: String, terminal: bool },
    /// The process is shutting down
    Shutdown,
}

impl RelayEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            RelayEvent::UpstreamConnected => "UpstreamConnected",
            RelayEvent::UpstreamFailed { .. } => "UpstreamFailed",
            RelayEvent::FrameReceived { .. } => "FrameReceived",
            RelayEvent::CloseReceived { .. } => "CloseReceived",
            RelayEvent::Disconnected { .. } => "Disconnected",
            RelayEvent::Errored { .. } => "Errored",
            RelayEvent::Shutdown => "Shutdown",
        }
    }
}
