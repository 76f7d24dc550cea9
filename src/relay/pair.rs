//! IO driver for one client/upstream connection pair
//!
//! A single task owns the pair: it reads both legs, feeds what it reads to the
//! [`Relay`] state machine one event at a time, and hands the resulting
//! commands to a writer task per leg. Each writer drains its own unbounded
//! queue, so a slow leg never stalls reads on the other one.

use futures_util::stream::StreamExt;
use futures_util::{Sink, SinkExt, Stream};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::Leg;
use crate::intercept::Interceptor;
use crate::relay::commands::RelayCommand;
use crate::relay::events::RelayEvent;
use crate::relay::machine::Relay;
use crate::websocket::{Credentials, Inbound, Outbound, TransportError, WireMessage};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything needed to relay one accepted client socket.
pub struct ConnectionPair {
    id: Uuid,
    peer: SocketAddr,
    target_url: String,
    credentials: Credentials,
    interceptor: Arc<Interceptor>,
    shutdown: CancellationToken,
}

impl ConnectionPair {
    pub fn new(
        peer: SocketAddr,
        target_url: impl Into<String>,
        credentials: Credentials,
        interceptor: Arc<Interceptor>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            target_url: target_url.into(),
            credentials,
            interceptor,
            shutdown,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Relay `client` to the configured target until both legs are closed.
    pub async fn run<C, M, E>(self, client: C)
    where
        C: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
        M: WireMessage,
        E: TransportError,
    {
        let connect = connect_upstream(self.target_url.clone(), self.credentials.clone());
        self.run_with(client, connect).await
    }

    /// Like [`ConnectionPair::run`], with the upstream handshake supplied by
    /// the caller.
    pub async fn run_with<C, M, E, F, U, UM, UE>(self, client: C, connect: F)
    where
        C: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
        M: WireMessage,
        E: TransportError,
        F: Future<Output = Result<U, String>>,
        U: Stream<Item = Result<UM, UE>> + Sink<UM, Error = UE> + Send + 'static,
        UM: WireMessage,
        UE: TransportError,
    {
        let id = self.id;
        info!(
            connection_id = %id,
            peer = %self.peer,
            has_protocols = self.credentials.has_subprotocols(),
            has_auth_header = self.credentials.has_authorization(),
            "Client connected"
        );

        let mut relay = Relay::new(id, self.interceptor.clone());
        let (reports_tx, mut reports) = mpsc::unbounded_channel();

        let (client_sink, client_stream) = client.split();
        let mut client_stream = Some(client_stream);
        let (client_tx, client_writer) = spawn_writer(id, Leg::Client, client_sink, reports_tx.clone());

        let mut upstream_stream = None;
        let mut upstream_tx = None;
        let mut upstream_writer = None;

        tokio::pin!(connect);
        let mut connecting = true;
        let mut shutdown_seen = false;

        while !relay.is_closed() {
            let event = tokio::select! {
                _ = self.shutdown.cancelled(), if !shutdown_seen => {
                    shutdown_seen = true;
                    Some(RelayEvent::Shutdown)
                }
                result = &mut connect, if connecting => {
                    connecting = false;
                    match result {
                        Ok(upstream) => {
                            let (sink, stream) = upstream.split();
                            let (tx, writer) = spawn_writer(id, Leg::Upstream, sink, reports_tx.clone());
                            upstream_stream = Some(stream);
                            upstream_tx = Some(tx);
                            upstream_writer = Some(writer);
                            Some(RelayEvent::UpstreamConnected)
                        }
                        Err(error) => Some(RelayEvent::UpstreamFailed { error }),
                    }
                }
                Some(report) = reports.recv() => Some(report),
                item = next_message(&mut client_stream) => read_event(Leg::Client, item, &mut client_stream),
                item = next_message(&mut upstream_stream) => read_event(Leg::Upstream, item, &mut upstream_stream),
            };

            let Some(event) = event else { continue };
            for command in relay.handle_event(event) {
                dispatch(id, command, &client_tx, upstream_tx.as_ref());
            }
        }

        // Closing the queues lets each writer finish what is already queued.
        drop(client_tx);
        drop(upstream_tx);
        let _ = client_writer.await;
        if let Some(writer) = upstream_writer {
            let _ = writer.await;
        }

        info!(connection_id = %id, peer = %self.peer, "Connection pair closed");
    }
}

/// Open the upstream leg, presenting the client's credentials.
pub async fn connect_upstream(
    target_url: String,
    credentials: Credentials,
) -> Result<UpstreamSocket, String> {
    let mut request = target_url
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    credentials.apply(&mut request);

    let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| e.to_string())?;
    debug!(target_url = %target_url, status = %response.status(), "Target handshake complete");

    Ok(socket)
}

/// Next item from a leg that is still being read. Never resolves otherwise.
async fn next_message<S>(stream: &mut Option<S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn read_event<S, M, E>(leg: Leg, item: Option<Result<M, E>>, stream: &mut Option<S>) -> Option<RelayEvent>
where
    M: WireMessage,
    E: TransportError,
{
    match item {
        None => {
            *stream = None;
            Some(RelayEvent::Disconnected { leg })
        }
        Some(Ok(message)) => match message.into_inbound()? {
            Inbound::Frame(frame) => Some(RelayEvent::FrameReceived { from: leg, frame }),
            Inbound::Close(close) => Some(RelayEvent::CloseReceived { from: leg, close }),
        },
        Some(Err(e)) => {
            let terminal = e.is_terminal();
            if terminal {
                *stream = None;
            }
            Some(RelayEvent::Errored {
                leg,
                error: e.to_string(),
                terminal,
            })
        }
    }
}

fn dispatch(
    connection_id: Uuid,
    command: RelayCommand,
    client_tx: &mpsc::UnboundedSender<Outbound>,
    upstream_tx: Option<&mpsc::UnboundedSender<Outbound>>,
) {
    let (leg, outbound) = command.into_outbound();
    let tx = match leg {
        Leg::Client => Some(client_tx),
        Leg::Upstream => upstream_tx,
    };

    match tx {
        Some(tx) => {
            if tx.send(outbound).is_err() {
                debug!(connection_id = %connection_id, "{} writer already stopped", leg);
            }
        }
        None => warn!(connection_id = %connection_id, "No {} socket to send to", leg),
    }
}

/// Drain a leg's send queue into its socket. Write failures come back to the
/// pair as error events.
fn spawn_writer<S, M, E>(
    connection_id: Uuid,
    leg: Leg,
    mut sink: S,
    reports: mpsc::UnboundedSender<RelayEvent>,
) -> (mpsc::UnboundedSender<Outbound>, JoinHandle<()>)
where
    S: Sink<M, Error = E> + Send + Unpin + 'static,
    M: WireMessage,
    E: TransportError,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let handle = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let is_close = matches!(outbound, Outbound::Close(_));

            if let Err(e) = sink.send(M::from_outbound(outbound)).await {
                if e.is_closed() {
                    debug!(connection_id = %connection_id, error = %e, "{} socket closed before send", leg);
                    break;
                }

                let terminal = e.is_terminal();
                let _ = reports.send(RelayEvent::Errored {
                    leg,
                    error: e.to_string(),
                    terminal,
                });
                if terminal {
                    break;
                }
            }

            if is_close {
                break;
            }
        }
    });

    (tx, handle)
}
