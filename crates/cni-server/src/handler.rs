//! Address acquisition for a pod sandbox.
//!
//! The allocator resolves the pod's owner and binds an address from the
//! owner's StaticIP. Deployment pods may arrive before the controller has
//! created the record, or while every address is still held by pods that are
//! terminating; both cases wait for the record to change, bounded by the
//! configured timeout.

use std::sync::Arc;
use std::time::Duration;

use crds::{OwnerKind, OwnerPod, PoolDeclaration, static_ip_name};
use k8s_openapi::api::core::v1::Pod;
use staticip::{ClusterClientTrait, Mutation, OwnerResolver, ResolvedOwner, StaticIpError, pool, update_with_retry};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::PodRequest;
use crate::error::CniServerError;
use crate::link::{DeferredLinkConfigurator, LinkConfigurator};
use crate::notify::{PoolNotifier, RecordKey};

/// Outcome of an add request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// Address bound to the pod
    Assigned {
        /// Address with prefix length
        ip_address: String,
        /// Gateway for the address
        gateway: String,
    },
    /// Pod has no static address; default networking applies
    DoNothing,
}

/// Why a Deployment pod could not be served yet
enum Pending {
    NoRecord,
    Exhausted,
}

/// Binds addresses to pods on behalf of the CNI plugin
pub struct AddressAllocator {
    client: Arc<dyn ClusterClientTrait>,
    resolver: OwnerResolver<dyn ClusterClientTrait>,
    notifier: PoolNotifier,
    link: Arc<dyn LinkConfigurator>,
    acquire_timeout: Duration,
}

impl std::fmt::Debug for AddressAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressAllocator")
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl AddressAllocator {
    /// Create an allocator that leaves link setup to the agent
    pub fn new(client: Arc<dyn ClusterClientTrait>, notifier: PoolNotifier, acquire_timeout: Duration) -> Self {
        let resolver = OwnerResolver::new(Arc::clone(&client));
        Self {
            client,
            resolver,
            notifier,
            link: Arc::new(DeferredLinkConfigurator),
            acquire_timeout,
        }
    }

    /// Replace the link configurator
    #[must_use]
    pub fn with_link_configurator(mut self, link: Arc<dyn LinkConfigurator>) -> Self {
        self.link = link;
        self
    }

    /// Find or bind the address for the pod named in `request`.
    ///
    /// # Errors
    ///
    /// Backend failures only. Pods without a declaration, unsupported owners
    /// and pools that stay unavailable past the timeout yield
    /// [`Acquisition::DoNothing`].
    pub async fn acquire(&self, request: &PodRequest) -> Result<Acquisition, CniServerError> {
        let pod = self
            .client
            .get_pod(&request.pod_namespace, &request.pod_name)
            .await?;
        let key = OwnerPod::from_pod(&pod)
            .ok_or_else(|| StaticIpError::InvalidResource(format!("Pod {}/{} missing uid", request.pod_namespace, request.pod_name)))?;

        let owner = match self.resolver.resolve(&pod).await {
            Ok(owner) => owner,
            Err(e @ (StaticIpError::NoAddressDeclared(_) | StaticIpError::UnsupportedOwnerKind { .. })) => {
                debug!("No static address for pod {}: {}", key, e);
                return Ok(Acquisition::DoNothing);
            }
            Err(e) => return Err(e.into()),
        };

        let assigned = match owner.kind {
            OwnerKind::Pod => self.ensure_standalone(&pod, &owner, &key).await,
            OwnerKind::Deployment => self.acquire_from_deployment(&owner, &key).await,
        };
        let (ip_address, gateway) = match assigned {
            Ok(Some(assigned)) => assigned,
            Ok(None) => return Ok(Acquisition::DoNothing),
            // A retry cannot fix a bad declaration; only an edit to the owner can
            Err(CniServerError::StaticIp(StaticIpError::InvalidPool(msg))) => {
                warn!("Pod {} declares an invalid address: {}", key, msg);
                return Ok(Acquisition::DoNothing);
            }
            Err(e) => return Err(e),
        };

        info!("Assigned {} via {} to pod {}", ip_address, gateway, key);
        self.link.configure(request, &ip_address, &gateway).await?;
        Ok(Acquisition::Assigned { ip_address, gateway })
    }

    /// Makes sure the single-address record of a standalone pod exists and
    /// is held by this pod instance, then returns the declared address.
    async fn ensure_standalone(
        &self,
        pod: &Pod,
        owner: &ResolvedOwner,
        key: &OwnerPod,
    ) -> Result<Option<(String, String)>, CniServerError> {
        let decl = PoolDeclaration::from_annotations(OwnerKind::Pod, pod.metadata.annotations.as_ref())
            .ok_or_else(|| StaticIpError::NoAddressDeclared(key.to_string()))?;

        let mut sip = pool::new_static_ip(&owner.namespace, OwnerKind::Pod, &owner.name, &key.uid, &decl)?;
        pool::claim_all(&mut sip.spec, key);
        let Some(address) = sip.spec.used.first().cloned() else {
            return Err(StaticIpError::InvalidPool(format!("pod {key} declares no address")).into());
        };
        let gateway = sip.spec.gateway.clone();

        match self.client.create_static_ip(&sip).await {
            Ok(_) => debug!("Created StaticIP {}/{}", owner.namespace, owner.static_ip_name()),
            Err(StaticIpError::AlreadyExists(_)) => {
                // Left over from an earlier instance with the same name, or a retried request
                update_with_retry(&*self.client, &owner.namespace, &owner.static_ip_name(), |stored| {
                    if stored.spec.ip_pool == sip.spec.ip_pool
                        && stored.spec.gateway == sip.spec.gateway
                        && stored.spec.available.is_empty()
                        && stored.spec.ip_map.values().all(|holder| holder.as_ref() == Some(key))
                    {
                        return Ok(Mutation::Skip(()));
                    }
                    stored.spec = sip.spec.clone();
                    stored.metadata.owner_references = sip.metadata.owner_references.clone();
                    Ok(Mutation::Write(()))
                })
                .await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Some((address, gateway)))
    }

    /// Acquires from the Deployment's record, waiting while the record is
    /// missing or full. `None` means the pod should use default networking.
    async fn acquire_from_deployment(
        &self,
        owner: &ResolvedOwner,
        key: &OwnerPod,
    ) -> Result<Option<(String, String)>, CniServerError> {
        let deploy = self.client.get_deployment(&owner.namespace, &owner.name).await?;
        if PoolDeclaration::from_annotations(OwnerKind::Deployment, deploy.metadata.annotations.as_ref()).is_none() {
            return Ok(None);
        }

        let name = static_ip_name(OwnerKind::Deployment, &owner.name);
        let record: RecordKey = (owner.namespace.clone(), name.clone());
        let deadline = Instant::now() + self.acquire_timeout;
        let mut changes = self.notifier.subscribe();

        loop {
            let pending = match self.try_acquire(&owner.namespace, &name, key).await? {
                Ok(assigned) => return Ok(Some(assigned)),
                Err(pending) => pending,
            };
            match pending {
                Pending::NoRecord => debug!("StaticIP {}/{} not created yet, waiting", owner.namespace, name),
                Pending::Exhausted => debug!("StaticIP {}/{} is exhausted, waiting", owner.namespace, name),
            }
            if tokio::time::timeout_at(deadline, PoolNotifier::changed(&mut changes, &record))
                .await
                .is_err()
            {
                warn!(
                    "Timed out waiting for an address in {}/{} for pod {}",
                    owner.namespace, name, key
                );
                return Ok(None);
            }
        }
    }

    async fn try_acquire(
        &self,
        namespace: &str,
        name: &str,
        key: &OwnerPod,
    ) -> Result<Result<(String, String), Pending>, CniServerError> {
        let result = update_with_retry(&*self.client, namespace, name, |sip| {
            if let Some(ip) = sip.spec.address_of(&key.uid) {
                return Ok(Mutation::Skip(Some((ip.to_string(), sip.spec.gateway.clone()))));
            }
            match pool::acquire(&mut sip.spec, key) {
                Ok(assigned) => Ok(Mutation::Write(Some(assigned))),
                Err(StaticIpError::PoolExhausted(_)) => Ok(Mutation::Skip(None)),
                Err(e) => Err(e),
            }
        })
        .await;

        match result {
            Ok(Some(assigned)) => Ok(Ok(assigned)),
            Ok(None) => Ok(Err(Pending::Exhausted)),
            Err(StaticIpError::NotFound(_)) => Ok(Err(Pending::NoRecord)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "handler_test.rs"]
mod handler_test;
