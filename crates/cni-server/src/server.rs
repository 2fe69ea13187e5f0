//! Unix socket HTTP server.
//!
//! The CNI plugin talks HTTP/1.1 to this server over a Unix socket:
//! - `POST /api/v1/add` acquires the pod's address
//! - `POST /api/v1/del` is acknowledged; releases are driven by pod deletion
//!   in the controller

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::UnixListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::{PodRequest, PodResponse};
use crate::error::CniServerError;
use crate::handler::{Acquisition, AddressAllocator};

/// Build the endpoint router around `allocator`
pub fn router(allocator: Arc<AddressAllocator>) -> Router {
    Router::new()
        .route("/api/v1/add", post(handle_add))
        .route("/api/v1/del", post(handle_del))
        .layer(TraceLayer::new_for_http())
        .with_state(allocator)
}

async fn handle_add(
    State(allocator): State<Arc<AddressAllocator>>,
    Json(request): Json<PodRequest>,
) -> Result<Json<PodResponse>, CniServerError> {
    info!(
        "Add request for pod {}/{} (container {})",
        request.pod_namespace, request.pod_name, request.container_id
    );
    let response = match allocator.acquire(&request).await? {
        Acquisition::Assigned { ip_address, gateway } => PodResponse::assigned(ip_address, gateway),
        Acquisition::DoNothing => PodResponse::do_nothing(),
    };
    Ok(Json(response))
}

async fn handle_del(Json(request): Json<PodRequest>) -> StatusCode {
    debug!(
        "Del request for pod {}/{} (container {})",
        request.pod_namespace, request.pod_name, request.container_id
    );
    StatusCode::NO_CONTENT
}

fn remove_socket(path: &Path) -> Result<(), std::io::Error> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Endpoint bound to a Unix socket path
#[derive(Debug)]
pub struct CniServer {
    socket: PathBuf,
    allocator: Arc<AddressAllocator>,
}

impl CniServer {
    /// Creates a server that will listen on `socket`.
    pub fn new(socket: impl Into<PathBuf>, allocator: Arc<AddressAllocator>) -> Self {
        Self {
            socket: socket.into(),
            allocator,
        }
    }

    /// Serves until `shutdown` resolves, then removes the socket.
    ///
    /// A socket left behind by a previous run is removed before binding.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), CniServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        remove_socket(&self.socket)?;
        let listener = UnixListener::bind(&self.socket)?;
        info!("Listening on {}", self.socket.display());

        let result = axum::serve(listener, router(self.allocator))
            .with_graceful_shutdown(shutdown)
            .await;

        if let Err(e) = remove_socket(&self.socket) {
            warn!("Failed to remove socket {}: {}", self.socket.display(), e);
        }
        info!("CNI server stopped");
        result.map_err(CniServerError::from)
    }
}

#[cfg(test)]
#[path = "server_test.rs"]
mod server_test;
