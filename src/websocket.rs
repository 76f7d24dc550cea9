use http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use http::{HeaderMap, HeaderValue};
use std::error::Error as StdError;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
pub const NO_STATUS_RECEIVED: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const INTERNAL_ERROR: u16 = 1011;
pub const TLS_HANDSHAKE_FAILURE: u16 = 1015;

/// Close frame payloads are capped at 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON_LEN: usize = 123;

/// A data or control frame relayed between the two legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
        }
    }
}

/// Close code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// The reason is cut to what fits in a close frame.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: truncate_reason(reason.into()),
        }
    }

    pub fn no_status() -> Self {
        Self::new(NO_STATUS_RECEIVED, "")
    }

    /// A leg that went away without a close frame.
    pub fn abnormal() -> Self {
        Self::new(ABNORMAL_CLOSURE, "")
    }

    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, reason)
    }

    /// Codes 1005, 1006 and 1015 are reserved for local reporting and never
    /// appear on the wire.
    pub fn is_sendable(&self) -> bool {
        !matches!(
            self.code,
            NO_STATUS_RECEIVED | ABNORMAL_CLOSURE | TLS_HANDSHAKE_FAILURE
        )
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON_LEN {
        let mut end = MAX_CLOSE_REASON_LEN;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// What a leg delivered to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    Close(CloseInfo),
}

/// What the relay asks a leg to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Close(CloseInfo),
}

/// Conversion between relay frames and a socket library's message type.
pub trait WireMessage: Sized + Send + Unpin + 'static {
    fn from_outbound(outbound: Outbound) -> Self;

    /// `None` for raw frames the relay does not handle.
    fn into_inbound(self) -> Option<Inbound>;
}

impl WireMessage for Message {
    fn from_outbound(outbound: Outbound) -> Self {
        match outbound {
            Outbound::Frame(Frame::Text(text)) => Message::Text(text),
            Outbound::Frame(Frame::Binary(data)) => Message::Binary(data),
            Outbound::Frame(Frame::Ping(data)) => Message::Ping(data),
            Outbound::Frame(Frame::Pong(data)) => Message::Pong(data),
            Outbound::Close(close) if close.is_sendable() => Message::Close(Some(CloseFrame {
                code: close.code.into(),
                reason: close.reason.into(),
            })),
            Outbound::Close(_) => Message::Close(None),
        }
    }

    fn into_inbound(self) -> Option<Inbound> {
        let inbound = match self {
            Message::Text(text) => Inbound::Frame(Frame::Text(text)),
            Message::Binary(data) => Inbound::Frame(Frame::Binary(data)),
            Message::Ping(data) => Inbound::Frame(Frame::Ping(data)),
            Message::Pong(data) => Inbound::Frame(Frame::Pong(data)),
            Message::Close(Some(frame)) => {
                Inbound::Close(CloseInfo::new(u16::from(frame.code), frame.reason.into_owned()))
            }
            Message::Close(None) => Inbound::Close(CloseInfo::no_status()),
            Message::Frame(_) => return None,
        };
        Some(inbound)
    }
}

impl WireMessage for axum::extract::ws::Message {
    fn from_outbound(outbound: Outbound) -> Self {
        use axum::extract::ws::{CloseFrame, Message};

        match outbound {
            Outbound::Frame(Frame::Text(text)) => Message::Text(text),
            Outbound::Frame(Frame::Binary(data)) => Message::Binary(data),
            Outbound::Frame(Frame::Ping(data)) => Message::Ping(data),
            Outbound::Frame(Frame::Pong(data)) => Message::Pong(data),
            Outbound::Close(close) if close.is_sendable() => Message::Close(Some(CloseFrame {
                code: close.code,
                reason: close.reason.into(),
            })),
            Outbound::Close(_) => Message::Close(None),
        }
    }

    fn into_inbound(self) -> Option<Inbound> {
        use axum::extract::ws::Message;

        let inbound = match self {
            Message::Text(text) => Inbound::Frame(Frame::Text(text)),
            Message::Binary(data) => Inbound::Frame(Frame::Binary(data)),
            Message::Ping(data) => Inbound::Frame(Frame::Ping(data)),
            Message::Pong(data) => Inbound::Frame(Frame::Pong(data)),
            Message::Close(Some(frame)) => {
                Inbound::Close(CloseInfo::new(frame.code, frame.reason.into_owned()))
            }
            Message::Close(None) => Inbound::Close(CloseInfo::no_status()),
        };
        Some(inbound)
    }
}

/// Classification of socket errors surfaced by either leg.
pub trait TransportError: StdError + Send + Sync + 'static {
    /// Whether the leg can no longer carry frames after this error.
    fn is_terminal(&self) -> bool;

    /// Whether the error only reports that the socket is already shutting
    /// down, which the read side reports on its own.
    fn is_closed(&self) -> bool;
}

impl TransportError for tungstenite::Error {
    fn is_terminal(&self) -> bool {
        !matches!(
            self,
            tungstenite::Error::WriteBufferFull(_) | tungstenite::Error::Utf8
        )
    }

    fn is_closed(&self) -> bool {
        matches!(
            self,
            tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(ProtocolError::SendAfterClosing)
        )
    }
}

impl TransportError for axum::Error {
    fn is_terminal(&self) -> bool {
        self.source()
            .and_then(|inner| inner.downcast_ref::<tungstenite::Error>())
            .map_or(true, |err| err.is_terminal())
    }

    fn is_closed(&self) -> bool {
        self.source()
            .and_then(|inner| inner.downcast_ref::<tungstenite::Error>())
            .is_some_and(|err| err.is_closed())
    }
}

/// Credential material taken from the inbound upgrade request and presented
/// unchanged to the upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    subprotocols: Vec<String>,
    protocol_header: Option<HeaderValue>,
    authorization: Option<HeaderValue>,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let raw_protocols = headers.get(SEC_WEBSOCKET_PROTOCOL);

        let subprotocols: Vec<String> = raw_protocols
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(',')
                    .map(|protocol| protocol.trim().to_string())
                    .filter(|protocol| !protocol.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let protocol_header = if subprotocols.is_empty() {
            raw_protocols.cloned()
        } else {
            HeaderValue::from_str(&subprotocols.join(", "))
                .ok()
                .or_else(|| raw_protocols.cloned())
        };

        Self {
            subprotocols,
            protocol_header,
            authorization: headers.get(AUTHORIZATION).cloned(),
        }
    }

    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    pub fn has_subprotocols(&self) -> bool {
        self.protocol_header.is_some()
    }

    pub fn has_authorization(&self) -> bool {
        self.authorization.is_some()
    }

    /// Add the forwarded headers to an outgoing handshake request.
    pub fn apply<B>(&self, request: &mut http::Request<B>) {
        let headers = request.headers_mut();
        if let Some(protocols) = &self.protocol_header {
            headers.insert(SEC_WEBSOCKET_PROTOCOL, protocols.clone());
        }
        if let Some(authorization) = &self.authorization {
            headers.insert(AUTHORIZATION, authorization.clone());
        }
    }
}
