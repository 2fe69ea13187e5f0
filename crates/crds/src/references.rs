//! Pod references stored in a StaticIP address map
//!
//! An address is bound to the pod instance that holds it. The `uid` is what
//! release matches on: a pod's reported network state is not available when
//! its sandbox is created, so the address itself cannot be used as the key.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pod currently holding an address
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct OwnerPod {
    /// Namespace of the pod
    pub namespace: String,

    /// Name of the pod
    pub name: String,

    /// UID of the pod instance
    pub uid: String,
}

impl OwnerPod {
    /// Create a new pod reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// Build a reference from a pod's metadata, `None` if name or uid is missing
    pub fn from_pod(pod: &k8s_openapi::api::core::v1::Pod) -> Option<Self> {
        Some(Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: pod.metadata.name.clone()?,
            uid: pod.metadata.uid.clone()?,
        })
    }
}

impl std::fmt::Display for OwnerPod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.uid)
    }
}
