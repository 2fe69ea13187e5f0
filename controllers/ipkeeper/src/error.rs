//! Controller-specific error types.
//!
//! This module defines error types specific to the ipkeeper controller
//! that are not covered by the StaticIP engine errors.

use kube::Error as KubeError;
use staticip::StaticIpError;
use thiserror::Error;

/// Errors that can occur in the ipkeeper controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Allocation engine error
    #[error("StaticIP error: {0}")]
    StaticIp(#[from] StaticIpError),

    /// Leader record could not be encoded or decoded
    #[error("Leader record error: {0}")]
    LeaderRecord(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Leader lock request did not answer in time
    #[error("Leader lock request timed out after {0:?}")]
    LockTimeout(std::time::Duration),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
