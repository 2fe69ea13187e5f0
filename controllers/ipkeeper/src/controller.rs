//! Main controller implementation.
//!
//! This module contains the `Controller` struct that supervises watchers,
//! leadership and the per-term reconciliation workers.
//!
//! The controller alternates between two states:
//! - Standby: caches stay warm, intake drops every event
//! - Leading: intake fills a fresh set of queues, one worker drains each
//!
//! A term ends on lost leadership or shutdown; its queues are shut down, the
//! in-flight handlers finish, and nothing the term already wrote is undone.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::reflector::{self, ObjectRef, Store};
use staticip::{ClusterClient, ClusterClientTrait};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::error::ControllerError;
use crate::leader::{LeaderElector, LeadershipEvent};
use crate::queue::{WorkQueue, run_worker};
use crate::reconciler::Reconciler;
use crate::watcher::{DeletedPod, Intake, watch_deployments, watch_pods};

/// Queues of one leadership term
#[derive(Debug)]
pub struct WorkQueues {
    /// Deployments that need a StaticIP created
    pub add_workload: WorkQueue<ObjectRef<Deployment>>,
    /// Deployments whose pool or gateway changed
    pub update_workload: WorkQueue<ObjectRef<Deployment>>,
    /// Deleted pods whose address must be released
    pub delete_pod: WorkQueue<DeletedPod>,
}

impl WorkQueues {
    /// Fresh, empty queues
    pub fn new(max_retries: u32) -> Self {
        let backoff = ExponentialBackoff::default();
        Self {
            add_workload: WorkQueue::new("add-workload", backoff, max_retries),
            update_workload: WorkQueue::new("update-workload", backoff, max_retries),
            delete_pod: WorkQueue::new("delete-pod", backoff, max_retries),
        }
    }

    /// Shut every queue down
    pub fn shut_down(&self) {
        self.add_workload.shut_down();
        self.update_workload.shut_down();
        self.delete_pod.shut_down();
    }

    /// Items dropped after exhausting their retries, across all queues
    pub fn dropped(&self) -> u64 {
        self.add_workload.dropped() + self.update_workload.dropped() + self.delete_pod.dropped()
    }
}

/// Whether this replica currently drives reconciliation
#[derive(Debug, Default)]
pub enum ControllerState {
    /// Not leading; events are dropped
    #[default]
    Standby,
    /// Leading; events go to these queues
    Leading(Arc<WorkQueues>),
}

/// Workers of one leadership term
struct Term {
    queues: Arc<WorkQueues>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Main controller for StaticIP management.
pub struct Controller {
    config: Config,
    client: Client,
    reconciler: Arc<Reconciler>,
    intake: Arc<Intake>,
    deployments: Store<Deployment>,
    pods: Store<Pod>,
    deployment_watcher: JoinHandle<Result<(), ControllerError>>,
    pod_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("identity", &self.config.identity)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance and starts its watchers.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing ipkeeper controller");

        // Create Kubernetes client
        let client = Client::try_default().await?;

        let (deployment_api, pod_api): (Api<Deployment>, Api<Pod>) = match config.watch_namespace.as_deref() {
            Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns)),
            None => (Api::all(client.clone()), Api::all(client.clone())),
        };

        let (deployments, deployment_writer) = reflector::store();
        let (pods, pod_writer) = reflector::store();
        let intake = Arc::new(Intake::new());

        let cluster: Arc<dyn ClusterClientTrait> = Arc::new(ClusterClient::new(client.clone()));
        let reconciler = Arc::new(Reconciler::new(cluster, deployments.clone()));

        // Caches are kept warm in standby so a new term starts without a full relist
        let deployment_watcher = tokio::spawn(watch_deployments(
            deployment_api,
            deployment_writer,
            Arc::clone(&intake),
        ));
        let pod_watcher = tokio::spawn(watch_pods(pod_api, pod_writer, Arc::clone(&intake)));

        Ok(Self {
            config,
            client,
            reconciler,
            intake,
            deployments,
            pods,
            deployment_watcher,
            pod_watcher,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("ipkeeper controller running as {}", self.config.identity);

        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let elector = LeaderElector::new(self.client.clone(), &self.config);
        let elector_task = tokio::spawn(elector.run(events_tx, shutdown_rx));
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        let mut term: Option<Term> = None;
        let result = loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(LeadershipEvent::Gained) => {
                        if term.is_none() {
                            term = Some(self.start_term());
                        }
                    }
                    Some(LeadershipEvent::Lost) => {
                        if let Some(t) = term.take() {
                            self.stop_term(t).await;
                        }
                    }
                    None => break Err(ControllerError::Watch("leader elector stopped".to_string())),
                },
                () = &mut shutdown => {
                    info!("Shutdown signal received");
                    break Ok(());
                }
                result = &mut self.deployment_watcher => {
                    break Err(join_error("Deployment", result));
                }
                result = &mut self.pod_watcher => {
                    break Err(join_error("Pod", result));
                }
            }
        };

        // Stop intake first so nothing new is queued, then let in-flight work finish
        if let Some(t) = term.take() {
            self.stop_term(t).await;
        }
        let _ = shutdown_tx.send(true);
        drop(events_rx);
        if let Err(e) = elector_task.await {
            warn!("Leader elector task failed: {}", e);
        }
        self.deployment_watcher.abort();
        self.pod_watcher.abort();

        info!("ipkeeper controller stopped");
        result
    }

    /// Start a leadership term: route intake into fresh queues and spawn the workers.
    fn start_term(&self) -> Term {
        info!("Leadership gained, starting reconciliation");
        let queues = Arc::new(WorkQueues::new(self.config.queue_max_retries));
        self.intake.lead(Arc::clone(&queues));

        let (stop, mut stop_rx) = watch::channel(false);
        let reconciler = Arc::clone(&self.reconciler);
        let intake = Arc::clone(&self.intake);
        let deployments = self.deployments.clone();
        let pods = self.pods.clone();
        let term_queues = Arc::clone(&queues);

        let handle = tokio::spawn(async move {
            // Workers must not run against caches that have not finished their initial list
            let synced = async {
                deployments.wait_until_ready().await?;
                pods.wait_until_ready().await
            };
            tokio::select! {
                ready = synced => {
                    if let Err(e) = ready {
                        error!("Cache writer dropped before initial sync: {}", e);
                        return;
                    }
                }
                _ = stop_rx.changed() => return,
            }
            info!("Caches synced");

            let replayed = intake.replay_declared(&deployments);
            info!("Replayed {} Deployments with pool declarations", replayed);

            run_term_workers(reconciler, term_queues).await;
        });

        Term { queues, stop, handle }
    }

    /// End a leadership term: stop intake, shut the queues, wait for in-flight handlers.
    async fn stop_term(&self, term: Term) {
        info!("Stopping reconciliation");
        self.intake.stand_by();
        let _ = term.stop.send(true);
        term.queues.shut_down();
        if let Err(e) = term.handle.await {
            warn!("Reconciliation workers failed: {}", e);
        }
        let dropped = term.queues.dropped();
        if dropped > 0 {
            warn!("{} items were dropped after exhausting retries during this term", dropped);
        }
    }
}

/// Run one worker per queue until the queues are shut down.
pub async fn run_term_workers(reconciler: Arc<Reconciler>, queues: Arc<WorkQueues>) {
    let add = {
        let reconciler = Arc::clone(&reconciler);
        run_worker(queues.add_workload.clone(), move |key: ObjectRef<Deployment>| {
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.handle_add_workload(&key).await }
        })
    };
    let update = {
        let reconciler = Arc::clone(&reconciler);
        run_worker(queues.update_workload.clone(), move |key: ObjectRef<Deployment>| {
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.handle_update_workload(&key).await }
        })
    };
    let delete = run_worker(queues.delete_pod.clone(), move |item: DeletedPod| {
        let reconciler = Arc::clone(&reconciler);
        async move { reconciler.handle_delete_pod(&item.pod).await }
    });
    tokio::join!(add, update, delete);
}

fn join_error(kind: &str, result: Result<Result<(), ControllerError>, tokio::task::JoinError>) -> ControllerError {
    match result {
        Ok(Ok(())) => ControllerError::Watch(format!("{kind} watcher exited")),
        Ok(Err(e)) => ControllerError::Watch(format!("{kind} watcher error: {e}")),
        Err(e) => ControllerError::Watch(format!("{kind} watcher panicked: {e}")),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
