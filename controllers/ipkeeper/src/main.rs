//! ipkeeper Controller
//!
//! Keeps sticky static IPs for Kubernetes workloads:
//! - Deployment pool annotations become StaticIP records
//! - Pool changes resize the record and evict pods on removed addresses
//! - Deleted pods return their address to the pool
//!
//! Only the replica holding the leadership lock reconciles; the others keep
//! their caches warm and take over when the lock expires.

mod backoff;
mod config;
mod controller;
mod error;
mod leader;
mod queue;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use config::Config;
use controller::Controller;
use crate::error::ControllerError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube is built with rustls; pick the crypto provider before the first connection
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting ipkeeper Controller");

    // Load configuration from environment variables
    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Identity: {}", config.identity);
    info!("  Lock namespace: {}", config.lock_namespace);
    info!(
        "  Namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!(
        "  Lease: {:?}, renew deadline: {:?}, retry period: {:?}",
        config.lease_duration, config.renew_deadline, config.retry_period
    );

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
