//! Mock ClusterClient for unit testing
//!
//! In-memory implementation of [`ClusterClientTrait`] so the controller and the
//! CNI server can be exercised without an API server. Replace honours
//! `resourceVersion` the way the API server does, and conflicts can be injected
//! to drive the retry paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crds::{OwnerPod, StaticIP};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::client::ClusterClientTrait;
use crate::error::StaticIpError;

type Key = (String, String);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn meta_key(meta: &ObjectMeta) -> Key {
    key(
        meta.namespace.as_deref().unwrap_or("default"),
        meta.name.as_deref().unwrap_or_default(),
    )
}

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pods: Arc<Mutex<HashMap<Key, Pod>>>,
    replica_sets: Arc<Mutex<HashMap<Key, ReplicaSet>>>,
    deployments: Arc<Mutex<HashMap<Key, Deployment>>>,
    static_ips: Arc<Mutex<HashMap<Key, StaticIP>>>,
    // Counter for resourceVersion
    next_version: Arc<Mutex<u64>>,
    pending_conflicts: Arc<Mutex<u32>>,
    failing_deletes: Arc<Mutex<HashSet<String>>>,
    deleted_pods: Arc<Mutex<Vec<OwnerPod>>>,
    replace_calls: Arc<Mutex<u32>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create an empty mock client
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_version(&self) -> String {
        let mut v = lock(&self.next_version);
        *v += 1;
        v.to_string()
    }

    /// Add a pod to the mock store (for test setup)
    pub fn add_pod(&self, pod: Pod) {
        lock(&self.pods).insert(meta_key(&pod.metadata), pod);
    }

    /// Add a ReplicaSet to the mock store (for test setup)
    pub fn add_replica_set(&self, rs: ReplicaSet) {
        lock(&self.replica_sets).insert(meta_key(&rs.metadata), rs);
    }

    /// Add a Deployment to the mock store (for test setup)
    pub fn add_deployment(&self, deploy: Deployment) {
        lock(&self.deployments).insert(meta_key(&deploy.metadata), deploy);
    }

    /// Add a StaticIP to the mock store, assigning it a fresh resourceVersion
    pub fn add_static_ip(&self, mut sip: StaticIP) {
        sip.metadata.resource_version = Some(self.bump_version());
        lock(&self.static_ips).insert(meta_key(&sip.metadata), sip);
    }

    /// Current stored StaticIP, if any
    pub fn static_ip(&self, namespace: &str, name: &str) -> Option<StaticIP> {
        lock(&self.static_ips).get(&key(namespace, name)).cloned()
    }

    /// Make the next `count` replace calls fail with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        *lock(&self.pending_conflicts) = count;
    }

    /// Make deletes of the pod with this uid fail with a server error
    pub fn fail_delete_for(&self, uid: &str) {
        lock(&self.failing_deletes).insert(uid.to_string());
    }

    /// Pods deleted through [`ClusterClientTrait::delete_pod`], in call order
    pub fn deleted_pods(&self) -> Vec<OwnerPod> {
        lock(&self.deleted_pods).clone()
    }

    /// Number of replace calls seen, including rejected ones
    pub fn replace_calls(&self) -> u32 {
        *lock(&self.replace_calls)
    }
}

fn not_found(kind: &str, namespace: &str, name: &str) -> StaticIpError {
    StaticIpError::NotFound(format!("{kind} {namespace}/{name} not found"))
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StaticIpError> {
        lock(&self.pods)
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("pods", namespace, name))
    }

    async fn delete_pod(&self, pod: &OwnerPod) -> Result<(), StaticIpError> {
        if lock(&self.failing_deletes).contains(&pod.uid) {
            return Err(StaticIpError::InvalidResource(format!("delete of {pod} rejected")));
        }
        let mut pods = lock(&self.pods);
        let k = key(&pod.namespace, &pod.name);
        match pods.get(&k) {
            Some(existing) if existing.metadata.uid.as_deref() != Some(pod.uid.as_str()) => {
                return Err(StaticIpError::Conflict(format!("uid precondition failed for {pod}")));
            }
            Some(_) => {
                pods.remove(&k);
            }
            None => return Err(not_found("pods", &pod.namespace, &pod.name)),
        }
        drop(pods);
        lock(&self.deleted_pods).push(pod.clone());
        Ok(())
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet, StaticIpError> {
        lock(&self.replica_sets)
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("replicasets", namespace, name))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StaticIpError> {
        lock(&self.deployments)
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("deployments", namespace, name))
    }

    async fn get_static_ip(&self, namespace: &str, name: &str) -> Result<StaticIP, StaticIpError> {
        lock(&self.static_ips)
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("staticips", namespace, name))
    }

    async fn create_static_ip(&self, sip: &StaticIP) -> Result<StaticIP, StaticIpError> {
        let k = meta_key(&sip.metadata);
        let mut store = lock(&self.static_ips);
        if store.contains_key(&k) {
            return Err(StaticIpError::AlreadyExists(format!(
                "staticips {}/{} already exists",
                k.0, k.1
            )));
        }
        let mut created = sip.clone();
        created.metadata.resource_version = Some(self.bump_version());
        store.insert(k, created.clone());
        Ok(created)
    }

    async fn replace_static_ip(&self, sip: &StaticIP) -> Result<StaticIP, StaticIpError> {
        *lock(&self.replace_calls) += 1;
        let k = meta_key(&sip.metadata);
        {
            let mut pending = lock(&self.pending_conflicts);
            if *pending > 0 {
                *pending -= 1;
                return Err(StaticIpError::Conflict(format!(
                    "staticips {}/{}: the object has been modified",
                    k.0, k.1
                )));
            }
        }
        let mut store = lock(&self.static_ips);
        let current = store
            .get(&k)
            .ok_or_else(|| not_found("staticips", &k.0, &k.1))?;
        if current.metadata.resource_version != sip.metadata.resource_version {
            return Err(StaticIpError::Conflict(format!(
                "staticips {}/{}: the object has been modified",
                k.0, k.1
            )));
        }
        let mut replaced = sip.clone();
        replaced.metadata.resource_version = Some(self.bump_version());
        store.insert(k, replaced.clone());
        Ok(replaced)
    }
}
