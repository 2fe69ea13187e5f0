//! ipkeeper CNI Server
//!
//! Node-local endpoint the CNI plugin calls while setting up a pod sandbox.

use std::sync::Arc;

use anyhow::Result;
use cni_server::notify::watch_static_ips;
use cni_server::{AddressAllocator, CniServer, PoolNotifier, ServerConfig};
use crds::StaticIP;
use kube::{Api, Client};
use staticip::{ClusterClient, ClusterClientTrait};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // kube is built with rustls; pick the crypto provider before the first connection
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting ipkeeper CNI Server");

    // Load configuration from environment variables
    let config = ServerConfig::from_env()?;
    info!("Configuration:");
    info!("  Socket: {}", config.bind_socket.display());
    info!("  Acquire timeout: {:?}", config.acquire_timeout);

    let client = Client::try_default().await?;
    let notifier = PoolNotifier::new();
    let watch = tokio::spawn(watch_static_ips(Api::<StaticIP>::all(client.clone()), notifier.clone()));

    let cluster: Arc<dyn ClusterClientTrait> = Arc::new(ClusterClient::new(client));
    let allocator = Arc::new(AddressAllocator::new(cluster, notifier, config.acquire_timeout));
    let server = CniServer::new(config.bind_socket, allocator);

    server.serve(shutdown_signal()).await?;
    watch.abort();

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received");
}
