//! Wire types exchanged with the CNI plugin.

use serde::{Deserialize, Serialize};

/// Identity of the pod whose sandbox is being set up (or torn down)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodRequest {
    /// Pod name
    pub pod_name: String,
    /// Pod namespace
    pub pod_namespace: String,
    /// Sandbox container id
    #[serde(default)]
    pub container_id: String,
    /// Path of the sandbox network namespace
    #[serde(default, alias = "netNs")]
    pub network_namespace_path: String,
    /// Host bridge the pod's veth is attached to
    #[serde(default, alias = "cni0")]
    pub bridge_device_name: String,
}

/// Answer to an add request.
///
/// Either an address and gateway, or `doNothing` when the pod has no static
/// address and the plugin should leave networking to the default path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodResponse {
    /// Assigned address with prefix length
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    /// Gateway for the assigned address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    /// Leave the pod on default networking
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub do_nothing: bool,
}

impl PodResponse {
    /// Response carrying an assigned address
    pub fn assigned(ip_address: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            gateway: gateway.into(),
            do_nothing: false,
        }
    }

    /// Response telling the plugin to skip static addressing
    pub fn do_nothing() -> Self {
        Self {
            do_nothing: true,
            ..Self::default()
        }
    }
}

/// Body of a failed request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// What went wrong
    pub error: String,
}
