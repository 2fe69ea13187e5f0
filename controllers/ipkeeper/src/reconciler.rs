//! Reconciliation logic for StaticIP pools.
//!
//! Each handler processes one queue key and is safe to repeat: creating a
//! record that exists, resizing to the pool already stored and releasing an
//! address nobody holds all leave the cluster as they found it.

use std::sync::Arc;

use crds::{OwnerKind, OwnerPod, PoolDeclaration, static_ip_name};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube_runtime::reflector::{ObjectRef, Store};
use staticip::{ClusterClientTrait, Mutation, OwnerResolver, StaticIpError, pool, update_with_retry};
use tracing::{debug, info, warn};

use crate::error::ControllerError;

/// Reconciles StaticIP records against Deployments and deleted Pods.
pub struct Reconciler {
    client: Arc<dyn ClusterClientTrait>,
    resolver: OwnerResolver<dyn ClusterClientTrait>,
    deployments: Store<Deployment>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

fn namespace_of(key: &ObjectRef<Deployment>) -> &str {
    key.namespace.as_deref().unwrap_or("default")
}

impl Reconciler {
    /// Creates a new reconciler reading Deployments from `deployments`.
    pub fn new(client: Arc<dyn ClusterClientTrait>, deployments: Store<Deployment>) -> Self {
        let resolver = OwnerResolver::new(Arc::clone(&client));
        Self {
            client,
            resolver,
            deployments,
        }
    }

    /// Materializes the StaticIP of a Deployment that declares a pool.
    ///
    /// A record that already exists is left alone; pool changes go through
    /// [`Reconciler::handle_update_workload`].
    pub async fn handle_add_workload(&self, key: &ObjectRef<Deployment>) -> Result<(), ControllerError> {
        let Some(deploy) = self.deployments.get(key) else {
            debug!("Deployment {} is gone, nothing to add", key);
            return Ok(());
        };
        let Some(decl) = PoolDeclaration::from_annotations(OwnerKind::Deployment, deploy.metadata.annotations.as_ref())
        else {
            return Ok(());
        };
        let namespace = namespace_of(key);
        let uid = deploy
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| StaticIpError::InvalidResource(format!("Deployment {key} missing uid")))?;

        let sip = match pool::new_static_ip(namespace, OwnerKind::Deployment, &key.name, uid, &decl) {
            Ok(sip) => sip,
            Err(StaticIpError::InvalidPool(msg)) => {
                warn!("Deployment {} declares an invalid pool: {}", key, msg);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.client.create_static_ip(&sip).await {
            Ok(_) => {
                info!(
                    "Created StaticIP {}/{} with {} addresses",
                    namespace,
                    static_ip_name(OwnerKind::Deployment, &key.name),
                    sip.spec.available.len()
                );
                Ok(())
            }
            Err(StaticIpError::AlreadyExists(_)) => {
                debug!("StaticIP for Deployment {} already exists", key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Applies a changed pool or gateway to the Deployment's StaticIP.
    ///
    /// Pods holding addresses that left the pool are deleted so their
    /// replacements acquire from the new one.
    pub async fn handle_update_workload(&self, key: &ObjectRef<Deployment>) -> Result<(), ControllerError> {
        let Some(deploy) = self.deployments.get(key) else {
            debug!("Deployment {} is gone, nothing to update", key);
            return Ok(());
        };
        let Some(decl) = PoolDeclaration::from_annotations(OwnerKind::Deployment, deploy.metadata.annotations.as_ref())
        else {
            info!("Deployment {} no longer declares a pool, keeping its StaticIP", key);
            return Ok(());
        };
        let namespace = namespace_of(key);
        let new_spec = match pool::new_spec(namespace, OwnerKind::Deployment, &decl) {
            Ok(spec) => spec,
            Err(StaticIpError::InvalidPool(msg)) => {
                warn!("Deployment {} declares an invalid pool: {}", key, msg);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let name = static_ip_name(OwnerKind::Deployment, &key.name);

        let result = update_with_retry(&*self.client, namespace, &name, |sip| {
            if sip.spec.ip_pool == new_spec.ip_pool && sip.spec.gateway == new_spec.gateway {
                return Ok(Mutation::Skip(None));
            }
            let (merged, evicted) = pool::reconcile_resize(sip, new_spec.clone());
            *sip = merged;
            Ok(Mutation::Write(Some(evicted)))
        })
        .await;

        let resized = match result {
            Ok(resized) => resized,
            Err(StaticIpError::NotFound(_)) => {
                info!("No StaticIP for Deployment {} yet, creating it", key);
                return self.handle_add_workload(key).await;
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(evicted) = resized {
            info!(
                "Resized StaticIP {}/{} to pool {}, evicting {} pods",
                namespace,
                name,
                new_spec.ip_pool,
                evicted.len()
            );
            for pod in &evicted {
                self.evict(pod).await;
            }
        }

        self.release_vanished_holders(namespace, &name).await?;
        Ok(())
    }

    /// Releases addresses whose holder no longer exists.
    ///
    /// Deletions that happen while no replica is leading never reach a
    /// queue, so every term re-checks the holders of each record against
    /// the API server. A pod recreated under the same name has a new uid
    /// and counts as gone. Returns how many addresses were released.
    pub async fn release_vanished_holders(&self, namespace: &str, name: &str) -> Result<usize, ControllerError> {
        let sip = match self.client.get_static_ip(namespace, name).await {
            Ok(sip) => sip,
            Err(StaticIpError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut vanished = Vec::new();
        for holder in sip.spec.ip_map.values().flatten() {
            match self.client.get_pod(&holder.namespace, &holder.name).await {
                Ok(pod) if pod.metadata.uid.as_deref() == Some(holder.uid.as_str()) => {}
                Ok(_) | Err(StaticIpError::NotFound(_)) => vanished.push(holder.uid.clone()),
                Err(e) => return Err(e.into()),
            }
        }
        if vanished.is_empty() {
            return Ok(0);
        }

        let result = update_with_retry(&*self.client, namespace, name, |sip| {
            let released: Vec<String> = vanished
                .iter()
                .filter_map(|uid| pool::release(&mut sip.spec, uid))
                .collect();
            Ok(if released.is_empty() {
                Mutation::Skip(released)
            } else {
                Mutation::Write(released)
            })
        })
        .await;
        let released = match result {
            Ok(released) => released,
            Err(StaticIpError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        for ip in &released {
            info!("Released {} held by a pod that no longer exists back to {}/{}", ip, namespace, name);
        }
        Ok(released.len())
    }

    // Best effort: the record is already written, a failed delete only
    // leaves the pod running on an address outside the pool.
    async fn evict(&self, pod: &OwnerPod) {
        match self.client.delete_pod(pod).await {
            Ok(()) => info!("Deleted pod {} holding an address removed from its pool", pod),
            Err(StaticIpError::NotFound(_)) => debug!("Pod {} already deleted", pod),
            Err(e) => warn!("Failed to delete pod {}: {}", pod, e),
        }
    }

    /// Returns the address held by a deleted pod to its pool.
    pub async fn handle_delete_pod(&self, pod: &Pod) -> Result<(), ControllerError> {
        let key = OwnerPod::from_pod(pod)
            .ok_or_else(|| StaticIpError::InvalidResource("Pod missing name or uid".to_string()))?;

        let owner = match self.resolver.resolve(pod).await {
            Ok(owner) => owner,
            Err(e) if e.is_benign() => {
                debug!("Pod {} has no StaticIP to release from: {}", key, e);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let name = owner.static_ip_name();

        let released = update_with_retry(&*self.client, &owner.namespace, &name, |sip| {
            Ok(match pool::release(&mut sip.spec, &key.uid) {
                Some(ip) => Mutation::Write(Some(ip)),
                None => Mutation::Skip(None),
            })
        })
        .await;

        match released {
            Ok(Some(ip)) => info!("Released {} from pod {} back to {}/{}", ip, key, owner.namespace, name),
            Ok(None) => warn!("Pod {} held no address in {}/{}", key, owner.namespace, name),
            Err(StaticIpError::NotFound(_)) => debug!("StaticIP {}/{} is gone, nothing to release", owner.namespace, name),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
