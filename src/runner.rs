use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::{Config, ConfigError, Credentials},
    hub::Hub,
    server::{self, AppState},
    source::{KubeWatchSource, WatchSource},
    supervisor::Supervisor,
};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server failed: {0}")]
    Serve(#[source] io::Error),
}

/// Resolves credentials and relays the configured collection until `shutdown`.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), RunError> {
    let credentials = Credentials::resolve(config.kubeconfig.as_deref())?;
    log::info!("Using {credentials:?} credentials");
    let client = credentials.client().await?;

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|source| RunError::Bind {
            addr: config.listen,
            source,
        })?;
    serve(&config, listener, KubeWatchSource::new(client), shutdown).await
}

/// Relays `source` to websocket subscribers accepted on `listener` until `shutdown`.
///
/// On shutdown the watch stops, every session is released, and sessions that
/// have not finished within the grace period are forcibly closed.
pub async fn serve<S: WatchSource>(
    config: &Config,
    listener: TcpListener,
    source: S,
    shutdown: CancellationToken,
) -> Result<(), RunError> {
    let hub = Arc::new(Hub::new(config.hub()));
    let supervisor = Supervisor::new(
        source,
        config.selector(),
        Arc::clone(&hub),
        &config.backoff(),
    );
    let watch = tokio::spawn(supervisor.run(shutdown.clone()));

    let state = AppState {
        hub: Arc::clone(&hub),
        sessions: TaskTracker::new(),
        shutdown: shutdown.clone(),
        force: CancellationToken::new(),
    };
    let app = server::router(state.clone());

    log::info!(
        "Relay listening on {}{}",
        listener.local_addr().unwrap_or(config.listen),
        server::WS_PATH
    );
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await;

    shutdown.cancel();
    drain(
        &hub,
        &state.sessions,
        &state.force,
        config.shutdown_timeout(),
    )
    .await;

    if let Err(err) = watch.await {
        log::error!("Watch supervisor panicked: {err}");
    }
    served.map_err(RunError::Serve)
}

/// Releases every subscriber and waits for their sessions,
/// cancelling `force` once `grace` has passed.
async fn drain(hub: &Hub, sessions: &TaskTracker, force: &CancellationToken, grace: Duration) {
    hub.close_all();
    sessions.close();
    if tokio::time::timeout(grace, sessions.wait()).await.is_err() {
        log::warn!(
            "{} sessions still open after {grace:?}, closing them",
            sessions.len()
        );
        force.cancel();
        sessions.wait().await;
    }
}
