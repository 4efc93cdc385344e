use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle, time::timeout};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    message::{Delivery, Envelope, FrameError, decode_binary, decode_text, encode},
    registry::{ConnectionHandle, ConnectionId, Registry},
    router::Router,
    stats::{RelayStats, StatsSnapshot},
};

/// How long a closing connection may spend flushing queued deliveries.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

struct RelayState {
    config: RelayConfig,
    registry: Arc<Registry>,
    router: Router,
    stats: RelayStats,
}

impl Relay {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let router = Router::new(Arc::clone(&registry), config.policy);
        Self {
            listener,
            state: Arc::new(RelayState {
                config,
                registry,
                router,
                stats: RelayStats::default(),
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    /// HTTP surface: WebSocket upgrades plus health and stats endpoints.
    pub fn app(&self) -> axum::Router {
        build_app(Arc::clone(&self.state))
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Relay { listener, state } = self;
        let app = build_app(state);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("relay shutting down");
        })
        .await
        .context("relay server failed")
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

fn build_app(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(state): State<Arc<RelayState>>) -> Json<StatsSnapshot> {
    let identities = state.registry.len().await;
    Json(state.stats.snapshot(identities))
}

async fn ws_upgrade(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state, peer))
}

async fn run_connection(socket: WebSocket, state: Arc<RelayState>, peer: SocketAddr) {
    let conn_id = state.registry.next_connection_id();
    let (handle, inbox) = ConnectionHandle::new(conn_id, state.config.outbound_buffer);
    state.stats.connection_opened();
    debug!(%conn_id, %peer, "connection opened");

    let (sink, stream) = socket.split();
    let writer = spawn_writer(sink, inbox, conn_id);

    let mut session = Session {
        state: &state,
        handle: &handle,
        user_id: None,
    };
    session.read_frames(stream).await;

    cleanup_connection(&state, handle, writer, peer).await;
}

fn spawn_writer(
    sink: SplitSink<WebSocket, Message>,
    inbox: mpsc::Receiver<Delivery>,
    conn_id: ConnectionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = write_deliveries(sink, inbox).await {
            debug!(%conn_id, error = ?err, "writer stopped");
        }
    })
}

async fn write_deliveries(
    mut sink: SplitSink<WebSocket, Message>,
    mut inbox: mpsc::Receiver<Delivery>,
) -> Result<()> {
    while let Some(delivery) = inbox.recv().await {
        let text = encode(&delivery).context("failed to encode delivery")?;
        sink.send(Message::Text(text)).await.context("failed to write delivery")?;
    }
    sink.close().await.context("failed to close socket")?;
    Ok(())
}

async fn cleanup_connection(
    state: &RelayState,
    handle: ConnectionHandle,
    mut writer: JoinHandle<()>,
    peer: SocketAddr,
) {
    let conn_id = handle.id();
    handle.begin_close();
    let removed = state.registry.remove_connection(conn_id).await;
    handle.mark_closed();
    state.stats.connection_closed();

    for user_id in removed {
        info!(%conn_id, %peer, %user_id, "client disconnected");
    }

    // The writer ends once every sender is gone, flushing a close frame.
    drop(handle);
    if timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!(%conn_id, "connection closed");
}

/// Per-connection read side. Frames are handled one at a time, in order.
struct Session<'a> {
    state: &'a RelayState,
    handle: &'a ConnectionHandle,
    user_id: Option<String>,
}

impl Session<'_> {
    async fn read_frames(&mut self, mut stream: SplitStream<WebSocket>) {
        let conn_id = self.handle.id();
        loop {
            let next = match self.state.config.idle_timeout {
                Some(limit) => match timeout(limit, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        info!(%conn_id, user_id = ?self.user_id, "closing idle connection");
                        break;
                    }
                },
                None => stream.next().await,
            };

            match next {
                Some(Ok(Message::Text(text))) => self.handle_frame(decode_text(&text)).await,
                Some(Ok(Message::Binary(bytes))) => self.handle_frame(decode_binary(&bytes)).await,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(%conn_id, ?frame, "client sent close");
                    break;
                }
                Some(Err(err)) => {
                    debug!(%conn_id, error = %err, "connection read failed");
                    break;
                }
                None => break,
            }
        }
    }

    async fn handle_frame(&mut self, decoded: Result<Envelope, FrameError>) {
        match decoded {
            Ok(Envelope::Login { user_id }) => self.login(user_id).await,
            Ok(Envelope::Message { from, to, payload }) => {
                let outcome = self.state.router.route(&from, &to, &payload).await;
                self.state.stats.message_routed(
                    outcome.delivered,
                    outcome.failed,
                    outcome.unknown_recipient,
                );
                debug!(
                    conn_id = %self.handle.id(),
                    %from,
                    ?to,
                    delivered = outcome.delivered,
                    failed = outcome.failed,
                    "message routed"
                );
            }
            Err(error) => {
                self.state.stats.frame_malformed();
                warn!(conn_id = %self.handle.id(), %error, "discarding malformed frame");
            }
        }
    }

    async fn login(&mut self, user_id: String) {
        let conn_id = self.handle.id();
        if user_id.is_empty() {
            warn!(%conn_id, "ignoring login without a user id");
            return;
        }

        let displaced = self
            .state
            .registry
            .register(&user_id, self.handle.clone())
            .await;
        if let Some(previous) = displaced {
            info!(%conn_id, previous = %previous.id(), %user_id, "identity taken over");
        }
        info!(%conn_id, %user_id, "client logged in");
        self.user_id = Some(user_id);
    }
}
