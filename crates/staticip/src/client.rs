//! Kubernetes access for the allocation engine
//!
//! The engine only needs a handful of calls against the API server. They sit
//! behind [`ClusterClientTrait`] so the controller and the CNI server can be
//! unit tested against an in-memory store.

use crds::{OwnerPod, StaticIP};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, PostParams, Preconditions};
use kube::{Api, Client};
use tracing::debug;

use crate::error::StaticIpError;

/// Trait for the Kubernetes operations used by the engine
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    /// Get a pod by namespace and name
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StaticIpError>;

    /// Delete the pod instance identified by the reference (uid precondition)
    async fn delete_pod(&self, pod: &OwnerPod) -> Result<(), StaticIpError>;

    /// Get a ReplicaSet by namespace and name
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet, StaticIpError>;

    /// Get a Deployment by namespace and name
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StaticIpError>;

    /// Get a StaticIP by namespace and name
    async fn get_static_ip(&self, namespace: &str, name: &str) -> Result<StaticIP, StaticIpError>;

    /// Create a StaticIP, failing with `AlreadyExists` if the name is taken
    async fn create_static_ip(&self, sip: &StaticIP) -> Result<StaticIP, StaticIpError>;

    /// Replace a StaticIP, guarded by its `resourceVersion`
    async fn replace_static_ip(&self, sip: &StaticIP) -> Result<StaticIP, StaticIpError>;
}

/// [`ClusterClientTrait`] backed by a live API server
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient").finish_non_exhaustive()
    }
}

impl ClusterClient {
    /// Wraps an authenticated client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Underlying client, for watchers
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn object_key(sip: &StaticIP) -> Result<(&str, &str), StaticIpError> {
    let name = sip
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| StaticIpError::InvalidResource("StaticIP missing name".to_string()))?;
    let namespace = sip
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| StaticIpError::InvalidResource(format!("StaticIP {name} missing namespace")))?;
    Ok((namespace, name))
}

#[async_trait::async_trait]
impl ClusterClientTrait for ClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StaticIpError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn delete_pod(&self, pod: &OwnerPod) -> Result<(), StaticIpError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                uid: Some(pod.uid.clone()),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        api.delete(&pod.name, &dp).await?;
        debug!("Deleted pod {}", pod);
        Ok(())
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet, StaticIpError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StaticIpError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_static_ip(&self, namespace: &str, name: &str) -> Result<StaticIP, StaticIpError> {
        let api: Api<StaticIP> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn create_static_ip(&self, sip: &StaticIP) -> Result<StaticIP, StaticIpError> {
        let (namespace, _) = object_key(sip)?;
        let api: Api<StaticIP> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), sip).await?)
    }

    async fn replace_static_ip(&self, sip: &StaticIP) -> Result<StaticIP, StaticIpError> {
        let (namespace, name) = object_key(sip)?;
        if sip.metadata.resource_version.is_none() {
            return Err(StaticIpError::InvalidResource(format!(
                "StaticIP {namespace}/{name} missing resourceVersion"
            )));
        }
        let api: Api<StaticIP> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), sip).await?)
    }
}
