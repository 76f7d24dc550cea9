//! Commands the relay state machine emits for the IO driver to carry out

use crate::connection::Leg;
use crate::websocket::{CloseInfo, Frame, Outbound};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCommand {
    /// Queue a frame on a leg
    Send { to: Leg, frame: Frame },
    /// Start the closing handshake on a leg
    Close { leg: Leg, close: CloseInfo },
}

impl RelayCommand {
    pub fn command_name(&self) -> &'static str {
        match self {
            RelayCommand::Send { .. } => "Send",
            RelayCommand::Close { .. } => "Close",
        }
    }

    pub fn leg(&self) -> Leg {
        match self {
            RelayCommand::Send { to, .. } => *to,
            RelayCommand::Close { leg, .. } => *leg,
        }
    }

    pub fn into_outbound(self) -> (Leg, Outbound) {
        match self {
            RelayCommand::Send { to, frame } => (to, Outbound::Frame(frame)),
            RelayCommand::Close { leg, close } => (leg, Outbound::Close(close)),
        }
    }
}
