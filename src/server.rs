use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::intercept::Interceptor;
use crate::relay::ConnectionPair;
use crate::websocket::Credentials;
use crate::{Error, Result};

/// Body returned to plain HTTP requests on the listening port.
pub const IDENTIFICATION: &str = "WebSocket Proxy Server";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    interceptor: Arc<Interceptor>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let interceptor = Interceptor::from_config(&config.interception)?;

        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                interceptor: Arc::new(interceptor),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            },
        })
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Number of connection pairs currently being relayed.
    pub fn active_connections(&self) -> usize {
        self.state.tracker.len()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config().listen_addr()).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` resolves, then drain.
    ///
    /// Every live pair sends `1001` to its client, the listener stops
    /// accepting, and pairs get the configured timeout to finish. Pairs still
    /// running after that are abandoned and `Error::ShutdownTimeout` is
    /// returned.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let state = self.state;
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            port = addr.port(),
            target_url = %state.config.server.target_url,
            "WebSocket proxy server started"
        );

        let stop_accepting = state.shutdown.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop_accepting.cancelled().await })
                .await
        });

        tokio::select! {
            _ = signal => {}
            result = &mut server => {
                error!("Listener stopped unexpectedly");
                return result.map_err(Error::internal)?.map_err(Error::from);
            }
        }

        info!("Shutting down server");
        state.shutdown.cancel();
        state.tracker.close();

        let timeout = state.config.shutdown_timeout();
        let tracker = state.tracker.clone();
        let drain = async move {
            let served = server.await;
            tracker.wait().await;
            served
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(served) => {
                served.map_err(Error::internal)??;
                info!("Server shut down complete");
                Ok(())
            }
            Err(_) => {
                error!(
                    remaining = state.tracker.len(),
                    "Forced shutdown after timeout"
                );
                Err(Error::ShutdownTimeout(timeout))
            }
        }
    }
}

async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        return (StatusCode::OK, IDENTIFICATION).into_response();
    };

    let credentials = Credentials::from_headers(&headers);
    let subprotocols = credentials.subprotocols().to_vec();
    let pair = ConnectionPair::new(
        peer,
        state.config.server.target_url.clone(),
        credentials,
        state.interceptor.clone(),
        state.shutdown.child_token(),
    );

    let tracker = state.tracker.clone();
    ws.protocols(subprotocols)
        .on_upgrade(move |socket| tracker.track_future(pair.run(socket)))
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
