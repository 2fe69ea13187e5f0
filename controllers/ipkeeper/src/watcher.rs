//! Kubernetes resource watchers.
//!
//! Deployments and Pods are watched through reflectors so the handlers can
//! read from a local cache. Every event also goes through [`Intake`], which
//! turns it into queue keys while this replica is leading and drops it
//! otherwise.
//!
//! A watch stream only carries the new object, so the intake keeps a small
//! snapshot per Deployment to tell adds from updates, and remembers pods with
//! owners so deletions missed during a relist are still released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crds::{GATEWAY_ANNOTATION, IP_POOL_ANNOTATION, OwnerKind, OwnerPod, PoolDeclaration, annotation_value};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::{WatchStreamExt, watcher};
use tracing::{debug, info, warn};

use crate::controller::{ControllerState, WorkQueues};
use crate::error::ControllerError;

/// Fields of a Deployment the update filter compares
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeploymentSnapshot {
    /// Last observed resourceVersion
    pub resource_version: Option<String>,
    /// Pool annotation, trimmed
    pub pool: Option<String>,
    /// Gateway annotation, trimmed
    pub gateway: Option<String>,
}

impl DeploymentSnapshot {
    /// Capture the relevant fields of `deploy`
    pub fn of(deploy: &Deployment) -> Self {
        let annotations = deploy.metadata.annotations.as_ref();
        Self {
            resource_version: deploy.metadata.resource_version.clone(),
            pool: annotations.and_then(|a| annotation_value(a, IP_POOL_ANNOTATION)),
            gateway: annotations.and_then(|a| annotation_value(a, GATEWAY_ANNOTATION)),
        }
    }
}

/// A Deployment that declares both a pool and a gateway needs a StaticIP.
pub fn should_enqueue_workload_add(deploy: &Deployment) -> bool {
    PoolDeclaration::from_annotations(OwnerKind::Deployment, deploy.metadata.annotations.as_ref()).is_some()
}

/// A new version whose pool or gateway changed needs a resize.
pub fn should_enqueue_workload_update(old: &DeploymentSnapshot, new: &DeploymentSnapshot) -> bool {
    old.resource_version != new.resource_version && (old.pool != new.pool || old.gateway != new.gateway)
}

/// Only pods with owners can hold an address from a shared pool.
pub fn should_enqueue_pod_delete(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| !refs.is_empty())
}

/// Pod deletion queue key: identity plus the final state of the pod
#[derive(Debug, Clone)]
pub struct DeletedPod {
    /// Identity of the deleted pod instance
    pub key: OwnerPod,
    /// Last known state, used to resolve the owner
    pub pod: Arc<Pod>,
}

impl PartialEq for DeletedPod {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for DeletedPod {}

impl std::hash::Hash for DeletedPod {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl std::fmt::Display for DeletedPod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.key, f)
    }
}

#[derive(Default)]
struct DeploymentTracker {
    snapshots: HashMap<ObjectRef<Deployment>, DeploymentSnapshot>,
    relist: Option<HashSet<ObjectRef<Deployment>>>,
}

#[derive(Default)]
struct PodTracker {
    known: HashMap<OwnerPod, Arc<Pod>>,
    relist: Option<HashSet<OwnerPod>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Filters watch events into the work queues of the current leadership term
#[derive(Default)]
pub struct Intake {
    state: RwLock<ControllerState>,
    deployments: Mutex<DeploymentTracker>,
    pods: Mutex<PodTracker>,
}

impl std::fmt::Debug for Intake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Intake")
            .field("leading", &self.queues().is_some())
            .finish_non_exhaustive()
    }
}

impl Intake {
    /// Create an intake in standby
    pub fn new() -> Self {
        Self::default()
    }

    /// Start routing events into `queues`
    pub fn lead(&self, queues: Arc<WorkQueues>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = ControllerState::Leading(queues);
    }

    /// Stop routing events; returns the queues of the term that ended
    pub fn stand_by(&self) -> Option<Arc<WorkQueues>> {
        let previous = std::mem::take(&mut *self.state.write().unwrap_or_else(PoisonError::into_inner));
        match previous {
            ControllerState::Leading(queues) => Some(queues),
            ControllerState::Standby => None,
        }
    }

    fn queues(&self) -> Option<Arc<WorkQueues>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            ControllerState::Leading(queues) => Some(Arc::clone(queues)),
            ControllerState::Standby => None,
        }
    }

    /// Apply one Deployment watch event
    pub fn on_deployment_event(&self, event: &watcher::Event<Deployment>) {
        match event {
            watcher::Event::Apply(deploy) | watcher::Event::InitApply(deploy) => {
                self.observe_deployment(deploy);
            }
            watcher::Event::Delete(deploy) => {
                lock(&self.deployments).snapshots.remove(&ObjectRef::from_obj(deploy));
            }
            watcher::Event::Init => {
                lock(&self.deployments).relist = Some(HashSet::new());
            }
            watcher::Event::InitDone => {
                let mut tracker = lock(&self.deployments);
                if let Some(seen) = tracker.relist.take() {
                    tracker.snapshots.retain(|key, _| seen.contains(key));
                }
            }
        }
    }

    fn observe_deployment(&self, deploy: &Deployment) {
        let key = ObjectRef::from_obj(deploy);
        let snapshot = DeploymentSnapshot::of(deploy);
        let previous = {
            let mut tracker = lock(&self.deployments);
            if let Some(seen) = tracker.relist.as_mut() {
                seen.insert(key.clone());
            }
            tracker.snapshots.insert(key.clone(), snapshot.clone())
        };

        let Some(queues) = self.queues() else {
            return;
        };
        match previous {
            None if should_enqueue_workload_add(deploy) => {
                info!("Enqueue add ip pool deployment {}", key);
                queues.add_workload.add(key);
            }
            Some(old) if should_enqueue_workload_update(&old, &snapshot) => {
                info!("Enqueue update ip pool deployment {}", key);
                queues.update_workload.add(key);
            }
            _ => {}
        }
    }

    /// Apply one Pod watch event
    pub fn on_pod_event(&self, event: &watcher::Event<Pod>) {
        match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                if !should_enqueue_pod_delete(pod) {
                    return;
                }
                let Some(key) = OwnerPod::from_pod(pod) else {
                    return;
                };
                let mut tracker = lock(&self.pods);
                if let Some(seen) = tracker.relist.as_mut() {
                    seen.insert(key.clone());
                }
                tracker.known.insert(key, Arc::new(pod.clone()));
            }
            watcher::Event::Delete(pod) => {
                if let Some(key) = OwnerPod::from_pod(pod) {
                    lock(&self.pods).known.remove(&key);
                }
                self.enqueue_pod_delete(Arc::new(pod.clone()));
            }
            watcher::Event::Init => {
                lock(&self.pods).relist = Some(HashSet::new());
            }
            watcher::Event::InitDone => {
                let vanished: Vec<Arc<Pod>> = {
                    let mut tracker = lock(&self.pods);
                    let Some(seen) = tracker.relist.take() else {
                        return;
                    };
                    let gone: Vec<OwnerPod> = tracker
                        .known
                        .keys()
                        .filter(|key| !seen.contains(*key))
                        .cloned()
                        .collect();
                    gone.iter().filter_map(|key| tracker.known.remove(key)).collect()
                };
                for pod in vanished {
                    debug!(
                        "Pod {} disappeared while the watch was down",
                        pod.metadata.name.as_deref().unwrap_or("<unknown>")
                    );
                    self.enqueue_pod_delete(pod);
                }
            }
        }
    }

    fn enqueue_pod_delete(&self, pod: Arc<Pod>) {
        if !should_enqueue_pod_delete(&pod) {
            return;
        }
        let Some(queues) = self.queues() else {
            return;
        };
        let Some(key) = OwnerPod::from_pod(&pod) else {
            return;
        };
        info!("Enqueue delete pod {}", key);
        queues.delete_pod.add(DeletedPod { key, pod });
    }

    /// Queue every cached Deployment that declares a pool.
    ///
    /// Called when leadership is gained. Events seen in standby only update
    /// the snapshots, so each declared Deployment goes to both the add queue
    /// (records for workloads created while no replica was leading) and the
    /// update queue (pool changes and pod deletions missed in that window).
    /// Returns how many Deployments were queued.
    pub fn replay_declared(&self, deployments: &Store<Deployment>) -> usize {
        let Some(queues) = self.queues() else {
            return 0;
        };
        let mut queued = 0;
        for deploy in deployments.state() {
            if should_enqueue_workload_add(&deploy) {
                let key = ObjectRef::from_obj(&*deploy);
                queues.add_workload.add(key.clone());
                queues.update_workload.add(key);
                queued += 1;
            }
        }
        queued
    }
}

/// Watch Deployments into `writer`, feeding every event to `intake`.
pub async fn watch_deployments(
    api: Api<Deployment>,
    writer: reflector::store::Writer<Deployment>,
    intake: Arc<Intake>,
) -> Result<(), ControllerError> {
    info!("Starting Deployment watcher");
    let mut stream = Box::pin(reflector::reflector(writer, watcher(api, watcher::Config::default())).default_backoff());
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => intake.on_deployment_event(&event),
            Err(e) => warn!("Deployment watch error: {}", e),
        }
    }
    Err(ControllerError::Watch("Deployment watch stream ended".to_string()))
}

/// Watch Pods into `writer`, feeding every event to `intake`.
pub async fn watch_pods(
    api: Api<Pod>,
    writer: reflector::store::Writer<Pod>,
    intake: Arc<Intake>,
) -> Result<(), ControllerError> {
    info!("Starting Pod watcher");
    let mut stream = Box::pin(reflector::reflector(writer, watcher(api, watcher::Config::default())).default_backoff());
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => intake.on_pod_event(&event),
            Err(e) => warn!("Pod watch error: {}", e),
        }
    }
    Err(ControllerError::Watch("Pod watch stream ended".to_string()))
}

#[cfg(test)]
#[path = "watcher_test.rs"]
mod watcher_test;
