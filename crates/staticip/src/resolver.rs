//! Owner resolution
//!
//! Maps a pod to the workload whose StaticIP governs it. Only two shapes are
//! supported: a standalone pod that declares its own address, and a pod
//! created by a ReplicaSet that is itself controlled by a Deployment.

use std::sync::Arc;

use crds::{OwnerKind, PoolDeclaration, StaticIP, static_ip_name};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::debug;

use crate::client::ClusterClientTrait;
use crate::error::StaticIpError;

/// Workload that owns a pod's StaticIP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOwner {
    /// Kind of the owning workload
    pub kind: OwnerKind,
    /// Namespace shared by the pod, its owner and the StaticIP
    pub namespace: String,
    /// Name of the owning workload
    pub name: String,
    /// UID of the owning workload, used for the StaticIP's owner reference
    pub uid: Option<String>,
}

impl ResolvedOwner {
    /// Name of the StaticIP this owner's addresses live in
    pub fn static_ip_name(&self) -> String {
        static_ip_name(self.kind, &self.name)
    }
}

/// Controller owner reference, falling back to the first one listed
pub fn primary_owner(refs: &[OwnerReference]) -> Option<&OwnerReference> {
    refs.iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| refs.first())
}

fn pod_label(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Resolves pods to their owners through the API server
pub struct OwnerResolver<C: ?Sized> {
    client: Arc<C>,
}

impl<C: ?Sized> std::fmt::Debug for OwnerResolver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerResolver").finish_non_exhaustive()
    }
}

impl<C: ?Sized> Clone for OwnerResolver<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<C: ClusterClientTrait + ?Sized> OwnerResolver<C> {
    /// Create a resolver on top of a cluster client
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Finds the workload whose StaticIP governs `pod`.
    ///
    /// # Errors
    ///
    /// `NoAddressDeclared` for an ownerless pod without both annotations,
    /// `UnsupportedOwnerKind` for any chain other than ReplicaSet -> Deployment,
    /// `NotFound` when the ReplicaSet is already gone.
    pub async fn resolve(&self, pod: &Pod) -> Result<ResolvedOwner, StaticIpError> {
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let refs = pod.metadata.owner_references.as_deref().unwrap_or_default();

        let Some(owner) = primary_owner(refs) else {
            let name = pod
                .metadata
                .name
                .clone()
                .ok_or_else(|| StaticIpError::InvalidResource("Pod missing name".to_string()))?;
            if PoolDeclaration::from_annotations(OwnerKind::Pod, pod.metadata.annotations.as_ref())
                .is_none()
            {
                return Err(StaticIpError::NoAddressDeclared(pod_label(pod)));
            }
            return Ok(ResolvedOwner {
                kind: OwnerKind::Pod,
                namespace,
                name,
                uid: pod.metadata.uid.clone(),
            });
        };

        if owner.kind != "ReplicaSet" {
            return Err(StaticIpError::UnsupportedOwnerKind {
                kind: owner.kind.clone(),
                pod: pod_label(pod),
            });
        }

        let rs = self.client.get_replica_set(&namespace, &owner.name).await?;
        let rs_refs = rs.metadata.owner_references.as_deref().unwrap_or_default();
        let Some(deploy) = primary_owner(rs_refs) else {
            return Err(StaticIpError::UnsupportedOwnerKind {
                kind: "ReplicaSet".to_string(),
                pod: pod_label(pod),
            });
        };
        if deploy.kind != "Deployment" {
            return Err(StaticIpError::UnsupportedOwnerKind {
                kind: deploy.kind.clone(),
                pod: pod_label(pod),
            });
        }

        debug!(
            "Pod {} resolved to Deployment {}/{} via ReplicaSet {}",
            pod_label(pod),
            namespace,
            deploy.name,
            owner.name
        );
        Ok(ResolvedOwner {
            kind: OwnerKind::Deployment,
            namespace,
            name: deploy.name.clone(),
            uid: Some(deploy.uid.clone()),
        })
    }

    /// Resolves `pod` and fetches the StaticIP of its owner.
    ///
    /// A standalone pod whose record was never created yields `Ok(None)`; a
    /// Deployment-owned pod whose record is missing yields `NotFound`.
    pub async fn resolve_static_ip(
        &self,
        pod: &Pod,
    ) -> Result<(ResolvedOwner, Option<StaticIP>), StaticIpError> {
        let owner = self.resolve(pod).await?;
        match self
            .client
            .get_static_ip(&owner.namespace, &owner.static_ip_name())
            .await
        {
            Ok(sip) => Ok((owner, Some(sip))),
            Err(StaticIpError::NotFound(_)) if owner.kind == OwnerKind::Pod => Ok((owner, None)),
            Err(e) => Err(e),
        }
    }
}
