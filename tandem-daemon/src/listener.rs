//! Inbound trigger listener: any HTTP request means "the peer has something
//! new, pull it".

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::error::{io_err, DaemonError};
use crate::sync_loop::SyncHandle;

/// Every method and path lands in the same handler; request bodies are
/// never read.
pub fn router(sync: SyncHandle) -> Router {
    Router::new().fallback(trigger).with_state(sync)
}

async fn trigger(
    State(sync): State<SyncHandle>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let from = connect_info.map(|ConnectInfo(addr)| addr.ip());
    match sync.request_pull(from).await {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            "OK\n",
        ),
        Err(err) => {
            tracing::warn!(error = %err, "trigger received but sync loop is gone");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::CONTENT_TYPE, "text/plain")],
                "sync loop stopped\n",
            )
        }
    }
}

/// Bind `0.0.0.0:<port>` and serve until shutdown.
pub async fn serve(
    port: u16,
    sync: SyncHandle,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| DaemonError::Bind { port, source })?;
    serve_on(listener, sync, shutdown_rx).await
}

pub async fn serve_on(
    listener: TcpListener,
    sync: SyncHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let local = listener
        .local_addr()
        .map_err(|e| io_err("trigger listener", e))?;
    tracing::info!(addr = %local, "trigger listener ready");

    let app = router(sync).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| io_err("trigger listener", e))
}
