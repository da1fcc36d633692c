//! HTTP surface: the `/ws` subscription endpoint and a health probe.
//!
//! Any origin may connect. Neither the upgrade nor the CORS layer restricts
//! `Origin`; the relay is meant to be reachable from any dashboard, and
//! subscribers are not authenticated.

use std::{fmt, net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{Sink, Stream, StreamExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::cors::{Any, CorsLayer};

use crate::{hub::Hub, session::Session};

pub const WS_PATH: &str = "/ws";
pub const HEALTH_PATH: &str = "/healthz";

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    /// Tracks running sessions so shutdown can wait for them.
    pub sessions: TaskTracker,
    /// Cancelled when the process starts shutting down.
    pub shutdown: CancellationToken,
    /// Cancelled when the shutdown grace period is over.
    pub force: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route(HEALTH_PATH, get(health_handler))
        .layer(cors)
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state, addr))
}

async fn serve_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (writer, reader) = socket.split();
    let session = attach(&state, writer, reader);
    let id = session.subscriber().id();
    log::info!("{id} connected from {addr}");

    let end = state.sessions.track_future(session.run(state.force)).await;
    log::debug!("Session of {id} from {addr} ended: {end:?}");
}

/// Registers a session for an upgraded connection.
///
/// A session attached after shutdown began is released at once,
/// since `close_all` may already have run.
fn attach<W, R, E>(state: &AppState, writer: W, reader: R) -> Session<W, R>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let session = Session::new(Arc::clone(&state.hub), writer, reader);
    if state.shutdown.is_cancelled() {
        state.hub.unregister(session.subscriber().id());
    }
    session
}
