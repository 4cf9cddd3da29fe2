use std::{fmt, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router as HttpRouter,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    error::TransportError,
    protocol,
    registry::Registry,
    router::{Flow, Router},
    session::{Session, SessionId, SessionIds},
    transport::{BoxedSource, SharedSink, tcp, ws},
};

pub const SHUTDOWN_NOTICE: &str = "Hub is shutting down";

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on a single write to one peer.
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Hub {
    listener: TcpListener,
    ws_listener: Option<TcpListener>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    config: HubConfig,
}

impl Hub {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            ws_listener: None,
            registry: Arc::new(Registry::new()),
            clock: Arc::new(SystemClock),
            config: HubConfig::default(),
        }
    }

    /// Also accept WebSocket sessions on `GET /ws` via this listener.
    pub fn with_websocket(mut self, listener: TcpListener) -> Self {
        self.ws_listener = Some(listener);
        self
    }

    pub fn with_config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn websocket_addr(&self) -> Option<std::io::Result<SocketAddr>> {
        self.ws_listener.as_ref().map(TcpListener::local_addr)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Hub {
            listener,
            ws_listener,
            registry,
            clock,
            config,
        } = self;

        let state = Arc::new(HubState {
            router: Router::new(registry, clock),
            ids: SessionIds::new(),
            write_timeout: config.write_timeout,
            stop: CancellationToken::new(),
            sessions: TaskTracker::new(),
        });

        let ws_server = ws_listener
            .map(|listener| spawn_websocket_server(listener, &state))
            .transpose()?;

        tokio::pin!(shutdown);
        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        state.sessions.close();
        state.sessions.wait().await;
        for session in state.router.registry().drain().await {
            session.sink.close().await;
        }

        if let Some(server) = ws_server {
            server
                .await
                .context("websocket server task panicked")?
                .context("websocket server failed")?;
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Everything a session task needs, shared by the accept loop and the
/// WebSocket route.
struct HubState {
    router: Router,
    ids: SessionIds,
    write_timeout: Duration,
    stop: CancellationToken,
    sessions: TaskTracker,
}

async fn handle_shutdown(state: &HubState) {
    info!("hub shutting down");
    state
        .router
        .announce(&protocol::server_notice(SHUTDOWN_NOTICE))
        .await;
    state.stop.cancel();
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, state: &Arc<HubState>) {
    match result {
        Ok((stream, peer)) => spawn_tcp_session(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_tcp_session(stream: TcpStream, peer: SocketAddr, state: &Arc<HubState>) {
    let state = Arc::clone(state);
    let (source, sink) = tcp::split(stream, state.write_timeout);
    state.sessions.clone().spawn(async move {
        serve_session(&state, Box::new(source), Arc::new(sink), peer).await;
    });
}

fn spawn_websocket_server(
    listener: TcpListener,
    state: &Arc<HubState>,
) -> Result<JoinHandle<std::io::Result<()>>> {
    let addr = listener
        .local_addr()
        .context("websocket listener has no local address")?;
    info!("websocket endpoint listening on ws://{addr}/ws");

    let app = HttpRouter::new()
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(state));

    let stop = state.stop.clone();
    Ok(tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
    }))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<HubState>>,
) -> Response {
    ws.on_upgrade(move |socket| {
        let sessions = state.sessions.clone();
        sessions.track_future(async move {
            let (source, sink) = ws::split_upgraded(socket, state.write_timeout);
            serve_session(&state, Box::new(source), Arc::new(sink), peer).await;
        })
    })
}

/// Why a session's read loop stopped.
enum SessionEnd {
    Closed,
    Exit,
    Shutdown,
    ReadFailed(TransportError),
    WriteFailed(TransportError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Closed => f.write_str("peer closed the connection"),
            SessionEnd::Exit => f.write_str("peer sent /exit"),
            SessionEnd::Shutdown => f.write_str("hub shutdown"),
            SessionEnd::ReadFailed(error) => write!(f, "read failed: {error}"),
            SessionEnd::WriteFailed(error) => write!(f, "write failed: {error}"),
        }
    }
}

async fn serve_session(state: &HubState, mut source: BoxedSource, sink: SharedSink, peer: SocketAddr) {
    let id = state.ids.next_id();
    let registry = state.router.registry();
    if let Err(error) = registry.add(Session::new(id, peer.to_string(), sink)).await {
        warn!(%peer, %error, "refusing session");
        return;
    }
    info!(session = %id, %peer, "session connected");

    let end = run_session(state, id, &mut source).await;
    debug!(session = %id, reason = %end, "session ending");
    state.router.teardown(id).await;
}

async fn run_session(
    state: &HubState,
    id: SessionId,
    source: &mut BoxedSource,
) -> SessionEnd {
    loop {
        let frame = select! {
            _ = state.stop.cancelled() => return SessionEnd::Shutdown,
            frame = source.receive() => frame,
        };

        match frame {
            Ok(Some(line)) => match state.router.route(id, &line).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return SessionEnd::Exit,
                Err(error) => return SessionEnd::WriteFailed(error),
            },
            Ok(None) => return SessionEnd::Closed,
            Err(error) => return SessionEnd::ReadFailed(error),
        }
    }
}
