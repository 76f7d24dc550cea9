//! Per-pair relay state machine
//!
//! The machine never touches a socket. The driver in [`super::pair`] turns
//! socket activity into [`RelayEvent`]s, hands each one to
//! [`Relay::handle_event`], and carries out the returned [`RelayCommand`]s.
//! Every forwarding decision checks the target leg's state right before the
//! send command is produced, so nothing is ever queued for a leg that is
//! closing or closed.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::connection::{Leg, LegState};
use crate::intercept::Interceptor;
use crate::relay::commands::RelayCommand;
use crate::relay::events::RelayEvent;
use crate::websocket::{CloseInfo, Frame, GOING_AWAY};

/// Lifecycle of a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Client accepted, upstream handshake in flight
    PendingUpstream,
    /// Both legs open, frames flow both ways
    Active,
    /// At least one leg is closing or gone
    Closing,
    /// Both legs closed
    Closed,
}

#[derive(Debug)]
pub struct Relay {
    connection_id: Uuid,
    interceptor: Arc<Interceptor>,
    state: RelayState,
    client: LegState,
    upstream: LegState,
    /// Client frames received before the upstream opened
    pending: VecDeque<Frame>,
    /// Close owed to the upstream once its handshake completes
    deferred_close: Option<CloseInfo>,
}

impl Relay {
    pub fn new(connection_id: Uuid, interceptor: Arc<Interceptor>) -> Self {
        Self {
            connection_id,
            interceptor,
            state: RelayState::PendingUpstream,
            client: LegState::Open,
            upstream: LegState::Connecting,
            pending: VecDeque::new(),
            deferred_close: None,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn leg_state(&self, leg: Leg) -> LegState {
        match leg {
            Leg::Client => self.client,
            Leg::Upstream => self.upstream,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == RelayState::Closed
    }

    /// Number of client frames waiting for the upstream to open.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn handle_event(&mut self, event: RelayEvent) -> Vec<RelayCommand> {
        let mut commands = Vec::new();

        if self.state == RelayState::Closed {
            debug!(
                connection_id = %self.connection_id,
                event = event.event_name(),
                "Ignoring event on closed connection pair"
            );
            return commands;
        }

        match event {
            RelayEvent::UpstreamConnected => self.on_upstream_connected(&mut commands),
            RelayEvent::UpstreamFailed { error } => self.on_upstream_failed(error, &mut commands),
            RelayEvent::FrameReceived { from, frame } => self.on_frame(from, frame, &mut commands),
            RelayEvent::CloseReceived { from, close } => {
                self.on_close_received(from, close, &mut commands)
            }
            RelayEvent::Disconnected { leg } => self.on_disconnected(leg, &mut commands),
            RelayEvent::Errored {
                leg,
                error,
                terminal,
            } => self.on_error(leg, error, terminal, &mut commands),
            RelayEvent::Shutdown => self.on_shutdown(&mut commands),
        }

        self.refresh_state();
        commands
    }

    fn on_upstream_connected(&mut self, commands: &mut Vec<RelayCommand>) {
        if self.upstream != LegState::Connecting {
            return;
        }

        info!(connection_id = %self.connection_id, "Connected to target WebSocket server");
        self.upstream = LegState::Open;

        while let Some(frame) = self.pending.pop_front() {
            self.forward(Leg::Upstream, frame, commands);
        }

        if let Some(close) = self.deferred_close.take() {
            self.close_leg(Leg::Upstream, close, commands);
        }
    }

    fn on_upstream_failed(&mut self, error: String, commands: &mut Vec<RelayCommand>) {
        error!(
            connection_id = %self.connection_id,
            error = %error,
            "Target connection error"
        );
        self.upstream = LegState::Closed;
        self.deferred_close = None;

        if !self.pending.is_empty() {
            debug!(
                connection_id = %self.connection_id,
                dropped = self.pending.len(),
                "Discarding client frames queued for unreachable target"
            );
            self.pending.clear();
        }

        self.close_leg(Leg::Client, CloseInfo::internal_error(error), commands);
    }

    fn on_frame(&mut self, from: Leg, frame: Frame, commands: &mut Vec<RelayCommand>) {
        let to = from.peer();
        if self.leg_state(to) == LegState::Connecting {
            debug!(
                connection_id = %self.connection_id,
                kind = frame.kind(),
                size = frame.len(),
                "Queueing client frame until target connection opens"
            );
            self.pending.push_back(frame);
            return;
        }

        self.forward(to, frame, commands);
    }

    fn forward(&mut self, to: Leg, frame: Frame, commands: &mut Vec<RelayCommand>) {
        let from = to.peer();
        if !self.leg_state(to).is_open() {
            debug!(
                connection_id = %self.connection_id,
                direction = from.direction(),
                kind = frame.kind(),
                "Dropping frame, {} socket already closing",
                to
            );
            return;
        }

        let frame = match frame {
            Frame::Text(text) if to == Leg::Upstream => Frame::Text(self.interceptor.intercept(text)),
            other => other,
        };

        match &frame {
            Frame::Ping(_) => {
                debug!(connection_id = %self.connection_id, direction = from.direction(), "Ping forwarded")
            }
            Frame::Pong(_) => {
                debug!(connection_id = %self.connection_id, direction = from.direction(), "Pong forwarded")
            }
            _ => debug!(
                connection_id = %self.connection_id,
                direction = from.direction(),
                binary = frame.is_binary(),
                size = frame.len(),
                "Message forwarded"
            ),
        }

        commands.push(RelayCommand::Send { to, frame });
    }

    fn on_close_received(&mut self, from: Leg, close: CloseInfo, commands: &mut Vec<RelayCommand>) {
        info!(
            connection_id = %self.connection_id,
            code = close.code,
            reason = %close.reason,
            "{} disconnected",
            leg_label(from)
        );

        if self.leg_state(from).is_open() {
            self.set_leg_state(from, LegState::Closing);
        }

        self.close_leg(from.peer(), close, commands);
    }

    fn on_disconnected(&mut self, leg: Leg, commands: &mut Vec<RelayCommand>) {
        let was_open = self.leg_state(leg).is_open();
        self.set_leg_state(leg, LegState::Closed);

        if was_open {
            info!(
                connection_id = %self.connection_id,
                "{} connection ended without a close frame",
                leg_label(leg)
            );
            self.close_leg(leg.peer(), CloseInfo::abnormal(), commands);
        }
    }

    fn on_error(&mut self, leg: Leg, error: String, terminal: bool, commands: &mut Vec<RelayCommand>) {
        error!(
            connection_id = %self.connection_id,
            error = %error,
            terminal,
            "{} connection error",
            leg_label(leg)
        );

        if terminal {
            self.set_leg_state(leg, LegState::Closed);
        }

        match leg {
            // Only a client error on a socket that is going away tears down the target.
            Leg::Client => {
                if self.client.is_terminating() {
                    self.close_leg(Leg::Upstream, CloseInfo::internal_error(error), commands);
                }
            }
            Leg::Upstream => {
                self.close_leg(Leg::Client, CloseInfo::internal_error(error), commands);
            }
        }
    }

    fn on_shutdown(&mut self, commands: &mut Vec<RelayCommand>) {
        self.close_leg(
            Leg::Client,
            CloseInfo::new(GOING_AWAY, "Server shutting down"),
            commands,
        );
    }

    fn close_leg(&mut self, leg: Leg, close: CloseInfo, commands: &mut Vec<RelayCommand>) {
        match self.leg_state(leg) {
            LegState::Open => {
                self.set_leg_state(leg, LegState::Closing);
                commands.push(RelayCommand::Close { leg, close });
            }
            LegState::Connecting => {
                // Sent as soon as the handshake completes, after any queued frames.
                self.deferred_close.get_or_insert(close);
            }
            LegState::Closing | LegState::Closed => {
                debug!(
                    connection_id = %self.connection_id,
                    code = close.code,
                    "{} socket already closing, not propagating close",
                    leg
                );
            }
        }
    }

    fn set_leg_state(&mut self, leg: Leg, state: LegState) {
        match leg {
            Leg::Client => self.client = state,
            Leg::Upstream => self.upstream = state,
        }
    }

    fn refresh_state(&mut self) {
        self.state = match (self.client, self.upstream) {
            (LegState::Closed, LegState::Closed) => RelayState::Closed,
            (LegState::Open, LegState::Open) => RelayState::Active,
            (LegState::Open, LegState::Connecting) => RelayState::PendingUpstream,
            _ => RelayState::Closing,
        };
    }
}

fn leg_label(leg: Leg) -> &'static str {
    match leg {
        Leg::Client => "Client",
        Leg::Upstream => "Target",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_replacement;
    use crate::websocket::{INTERNAL_ERROR, NORMAL_CLOSURE};

    const SETTINGS: &str = r#"{"type":"Settings","foo":1}"#;

    fn interceptor() -> Arc<Interceptor> {
        Arc::new(Interceptor::new("Settings", &default_replacement()).unwrap())
    }

    fn active_relay() -> Relay {
        let mut relay = Relay::new(Uuid::new_v4(), interceptor());
        assert!(relay.handle_event(RelayEvent::UpstreamConnected).is_empty());
        assert_eq!(relay.state(), RelayState::Active);
        relay
    }

    fn frame_from(from: Leg, frame: Frame) -> RelayEvent {
        RelayEvent::FrameReceived { from, frame }
    }

    fn close_from(from: Leg, code: u16, reason: &str) -> RelayEvent {
        RelayEvent::CloseReceived {
            from,
            close: CloseInfo::new(code, reason),
        }
    }

    fn error_on(leg: Leg, error: &str, terminal: bool) -> RelayEvent {
        RelayEvent::Errored {
            leg,
            error: error.to_string(),
            terminal,
        }
    }

    #[test]
    fn test_new_relay_is_pending() {
        let relay = Relay::new(Uuid::new_v4(), interceptor());
        assert_eq!(relay.state(), RelayState::PendingUpstream);
        assert_eq!(relay.leg_state(Leg::Client), LegState::Open);
        assert_eq!(relay.leg_state(Leg::Upstream), LegState::Connecting);
    }

    #[test]
    fn test_client_settings_text_is_replaced() {
        let interceptor = interceptor();
        let mut relay = Relay::new(Uuid::new_v4(), interceptor.clone());
        relay.handle_event(RelayEvent::UpstreamConnected);

        let commands = relay.handle_event(frame_from(Leg::Client, Frame::Text(SETTINGS.to_string())));
        assert_eq!(
            commands,
            vec![RelayCommand::Send {
                to: Leg::Upstream,
                frame: Frame::Text(interceptor.replacement().to_string()),
            }]
        );
    }

    #[test]
    fn test_client_binary_is_not_inspected() {
        let mut relay = active_relay();
        let payload = SETTINGS.as_bytes().to_vec();

        let commands = relay.handle_event(frame_from(Leg::Client, Frame::Binary(payload.clone())));
        assert_eq!(
            commands,
            vec![RelayCommand::Send {
                to: Leg::Upstream,
                frame: Frame::Binary(payload),
            }]
        );
    }

    #[test]
    fn test_upstream_frames_are_never_inspected() {
        let mut relay = active_relay();

        let text = relay.handle_event(frame_from(Leg::Upstream, Frame::Text(SETTINGS.to_string())));
        assert_eq!(
            text,
            vec![RelayCommand::Send {
                to: Leg::Client,
                frame: Frame::Text(SETTINGS.to_string()),
            }]
        );

        let binary = relay.handle_event(frame_from(Leg::Upstream, Frame::Binary(vec![0, 1, 2])));
        assert_eq!(
            binary,
            vec![RelayCommand::Send {
                to: Leg::Client,
                frame: Frame::Binary(vec![0, 1, 2]),
            }]
        );
    }

    #[test]
    fn test_ping_and_pong_are_forwarded_both_ways() {
        let mut relay = active_relay();

        for (from, frame) in [
            (Leg::Client, Frame::Ping(b"c-ping".to_vec())),
            (Leg::Client, Frame::Pong(b"c-pong".to_vec())),
            (Leg::Upstream, Frame::Ping(b"u-ping".to_vec())),
            (Leg::Upstream, Frame::Pong(b"u-pong".to_vec())),
        ] {
            let commands = relay.handle_event(frame_from(from, frame.clone()));
            assert_eq!(
                commands,
                vec![RelayCommand::Send {
                    to: from.peer(),
                    frame,
                }]
            );
        }
    }

    #[test]
    fn test_frames_are_forwarded_in_arrival_order() {
        let mut relay = active_relay();
        let frames: Vec<Frame> = (0..20)
            .map(|i| {
                if i % 2 == 0 {
                    Frame::Text(format!("message {}", i))
                } else {
                    Frame::Binary(vec![i as u8; i])
                }
            })
            .collect();

        let mut sent = Vec::new();
        for frame in &frames {
            for command in relay.handle_event(frame_from(Leg::Client, frame.clone())) {
                if let RelayCommand::Send { to: Leg::Upstream, frame } = command {
                    sent.push(frame);
                }
            }
        }

        assert_eq!(sent, frames);
    }

    #[test]
    fn test_frames_before_upstream_open_are_queued_then_flushed() {
        let interceptor = interceptor();
        let mut relay = Relay::new(Uuid::new_v4(), interceptor.clone());

        for frame in [
            Frame::Text(SETTINGS.to_string()),
            Frame::Binary(vec![7; 16]),
            Frame::Ping(b"early".to_vec()),
        ] {
            assert!(relay.handle_event(frame_from(Leg::Client, frame)).is_empty());
        }
        assert_eq!(relay.pending_frames(), 3);
        assert_eq!(relay.state(), RelayState::PendingUpstream);

        let commands = relay.handle_event(RelayEvent::UpstreamConnected);
        assert_eq!(
            commands,
            vec![
                RelayCommand::Send {
                    to: Leg::Upstream,
                    frame: Frame::Text(interceptor.replacement().to_string()),
                },
                RelayCommand::Send {
                    to: Leg::Upstream,
                    frame: Frame::Binary(vec![7; 16]),
                },
                RelayCommand::Send {
                    to: Leg::Upstream,
                    frame: Frame::Ping(b"early".to_vec()),
                },
            ]
        );
        assert_eq!(relay.pending_frames(), 0);
        assert_eq!(relay.state(), RelayState::Active);
    }

    #[test]
    fn test_client_close_while_pending_is_deferred() {
        let mut relay = Relay::new(Uuid::new_v4(), interceptor());
        relay.handle_event(frame_from(Leg::Client, Frame::Text("hello".to_string())));

        assert!(relay.handle_event(close_from(Leg::Client, 4001, "bye")).is_empty());
        assert_eq!(relay.state(), RelayState::Closing);

        let commands = relay.handle_event(RelayEvent::UpstreamConnected);
        assert_eq!(
            commands,
            vec![
                RelayCommand::Send {
                    to: Leg::Upstream,
                    frame: Frame::Text("hello".to_string()),
                },
                RelayCommand::Close {
                    leg: Leg::Upstream,
                    close: CloseInfo::new(4001, "bye"),
                },
            ]
        );
        assert_eq!(relay.leg_state(Leg::Upstream), LegState::Closing);
    }

    #[test]
    fn test_upstream_failure_closes_client_with_internal_error() {
        let mut relay = Relay::new(Uuid::new_v4(), interceptor());
        relay.handle_event(frame_from(Leg::Client, Frame::Text("lost".to_string())));

        let commands = relay.handle_event(RelayEvent::UpstreamFailed {
            error: "HTTP error: 401 Unauthorized".to_string(),
        });
        assert_eq!(
            commands,
            vec![RelayCommand::Close {
                leg: Leg::Client,
                close: CloseInfo::new(INTERNAL_ERROR, "HTTP error: 401 Unauthorized"),
            }]
        );
        assert_eq!(relay.pending_frames(), 0);
        assert_eq!(relay.leg_state(Leg::Upstream), LegState::Closed);
        assert_eq!(relay.state(), RelayState::Closing);

        // A late open never revives the pair.
        assert!(relay.handle_event(RelayEvent::UpstreamConnected).is_empty());
        assert_eq!(relay.leg_state(Leg::Upstream), LegState::Closed);
    }

    #[test]
    fn test_close_is_propagated_symmetrically() {
        for (code, reason) in [(NORMAL_CLOSURE, "done"), (GOING_AWAY, ""), (4321, "app specific")] {
            for from in [Leg::Client, Leg::Upstream] {
                let mut relay = active_relay();
                let commands = relay.handle_event(close_from(from, code, reason));
                assert_eq!(
                    commands,
                    vec![RelayCommand::Close {
                        leg: from.peer(),
                        close: CloseInfo::new(code, reason),
                    }]
                );
                assert_eq!(relay.state(), RelayState::Closing);
            }
        }
    }

    #[test]
    fn test_close_not_propagated_to_closing_peer() {
        let mut relay = active_relay();
        relay.handle_event(close_from(Leg::Upstream, NORMAL_CLOSURE, "done"));

        // The client's reply to our close must not bounce back upstream.
        let commands = relay.handle_event(close_from(Leg::Client, NORMAL_CLOSURE, "done"));
        assert!(commands.is_empty());
    }

    #[test]
    fn test_upstream_close_reaches_closed_state() {
        let mut relay = active_relay();

        let commands = relay.handle_event(close_from(Leg::Upstream, NORMAL_CLOSURE, "done"));
        assert_eq!(
            commands,
            vec![RelayCommand::Close {
                leg: Leg::Client,
                close: CloseInfo::new(NORMAL_CLOSURE, "done"),
            }]
        );

        relay.handle_event(close_from(Leg::Client, NORMAL_CLOSURE, "done"));
        relay.handle_event(RelayEvent::Disconnected { leg: Leg::Upstream });
        assert_eq!(relay.state(), RelayState::Closing);

        relay.handle_event(RelayEvent::Disconnected { leg: Leg::Client });
        assert_eq!(relay.state(), RelayState::Closed);
        assert!(relay.is_closed());
    }

    #[test]
    fn test_transient_client_error_keeps_upstream_open() {
        let mut relay = active_relay();

        let commands = relay.handle_event(error_on(Leg::Client, "invalid UTF-8", false));
        assert!(commands.is_empty());
        assert_eq!(relay.state(), RelayState::Active);

        let after = relay.handle_event(frame_from(Leg::Client, Frame::Text("still here".to_string())));
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn test_client_error_while_closing_closes_upstream() {
        let mut relay = active_relay();

        let commands = relay.handle_event(error_on(Leg::Client, "Connection reset by peer", true));
        assert_eq!(
            commands,
            vec![RelayCommand::Close {
                leg: Leg::Upstream,
                close: CloseInfo::new(INTERNAL_ERROR, "Connection reset by peer"),
            }]
        );
        assert_eq!(relay.leg_state(Leg::Client), LegState::Closed);
    }

    #[test]
    fn test_client_error_after_shutdown_close_closes_upstream() {
        let mut relay = active_relay();
        relay.handle_event(RelayEvent::Shutdown);
        assert_eq!(relay.leg_state(Leg::Client), LegState::Closing);

        let commands = relay.handle_event(error_on(Leg::Client, "broken pipe", false));
        assert_eq!(
            commands,
            vec![RelayCommand::Close {
                leg: Leg::Upstream,
                close: CloseInfo::new(INTERNAL_ERROR, "broken pipe"),
            }]
        );
    }

    #[test]
    fn test_upstream_error_always_closes_client() {
        for terminal in [true, false] {
            let mut relay = active_relay();
            let commands = relay.handle_event(error_on(Leg::Upstream, "TLS alert", terminal));
            assert_eq!(
                commands,
                vec![RelayCommand::Close {
                    leg: Leg::Client,
                    close: CloseInfo::new(INTERNAL_ERROR, "TLS alert"),
                }]
            );
        }
    }

    #[test]
    fn test_no_frames_forwarded_to_closing_leg() {
        let mut relay = active_relay();
        relay.handle_event(close_from(Leg::Client, NORMAL_CLOSURE, ""));
        assert_eq!(relay.leg_state(Leg::Upstream), LegState::Closing);

        // Upstream may still deliver frames before its close arrives.
        let commands = relay.handle_event(frame_from(Leg::Upstream, Frame::Text("late".to_string())));
        assert!(commands.is_empty());

        let commands = relay.handle_event(frame_from(Leg::Client, Frame::Binary(vec![1])));
        assert!(commands.is_empty());
    }

    #[test]
    fn test_disconnect_without_close_frame_propagates_abnormal_close() {
        let mut relay = active_relay();

        let commands = relay.handle_event(RelayEvent::Disconnected { leg: Leg::Upstream });
        assert_eq!(
            commands,
            vec![RelayCommand::Close {
                leg: Leg::Client,
                close: CloseInfo::abnormal(),
            }]
        );
        assert_eq!(relay.leg_state(Leg::Upstream), LegState::Closed);
    }

    #[test]
    fn test_shutdown_sends_going_away_to_client_only() {
        let mut relay = active_relay();

        let commands = relay.handle_event(RelayEvent::Shutdown);
        assert_eq!(
            commands,
            vec![RelayCommand::Close {
                leg: Leg::Client,
                close: CloseInfo::new(GOING_AWAY, "Server shutting down"),
            }]
        );
        assert_eq!(relay.leg_state(Leg::Upstream), LegState::Open);

        // The client's close reply is then carried upstream.
        let commands = relay.handle_event(close_from(Leg::Client, GOING_AWAY, "Server shutting down"));
        assert_eq!(
            commands,
            vec![RelayCommand::Close {
                leg: Leg::Upstream,
                close: CloseInfo::new(GOING_AWAY, "Server shutting down"),
            }]
        );
    }

    #[test]
    fn test_events_after_close_are_ignored() {
        let mut relay = active_relay();
        relay.handle_event(error_on(Leg::Upstream, "gone", true));
        relay.handle_event(RelayEvent::Disconnected { leg: Leg::Client });
        assert!(relay.is_closed());

        assert!(relay.handle_event(frame_from(Leg::Client, Frame::Text("x".to_string()))).is_empty());
        assert!(relay.handle_event(RelayEvent::Shutdown).is_empty());
    }
}
