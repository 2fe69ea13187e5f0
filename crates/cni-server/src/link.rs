//! Host-side link configuration
//!
//! Once an address is bound, the sandbox's veth pair has to carry it. The
//! calling agent does that today, so the default configurator only records
//! the decision; a node-local implementation can take over the device setup.

use async_trait::async_trait;
use tracing::debug;

use crate::api::PodRequest;
use crate::error::CniServerError;

/// Applies an acquired address to the pod's sandbox
#[async_trait]
pub trait LinkConfigurator: Send + Sync {
    /// Configure the sandbox described by `request` with `address` via `gateway`
    async fn configure(&self, request: &PodRequest, address: &str, gateway: &str) -> Result<(), CniServerError>;
}

/// Leaves device setup to the calling agent
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferredLinkConfigurator;

#[async_trait]
impl LinkConfigurator for DeferredLinkConfigurator {
    async fn configure(&self, request: &PodRequest, address: &str, gateway: &str) -> Result<(), CniServerError> {
        debug!(
            "Leaving link setup of {}/{} (container {}, netns {}) to the agent: {} via {}",
            request.pod_namespace,
            request.pod_name,
            request.container_id,
            request.network_namespace_path,
            address,
            gateway
        );
        Ok(())
    }
}
