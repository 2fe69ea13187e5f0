//! StaticIP change notifications
//!
//! Add requests that find no record or no free address wait here instead of
//! polling. A watch on StaticIP publishes the key of every applied record;
//! waiters only wake for the record they need.

use crds::StaticIP;
use futures::StreamExt;
use kube::Api;
use kube_runtime::{WatchStreamExt, watcher};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::error::CniServerError;

/// `(namespace, name)` of a StaticIP
pub type RecordKey = (String, String);

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of StaticIP changes to waiting requests
#[derive(Debug, Clone)]
pub struct PoolNotifier {
    tx: broadcast::Sender<RecordKey>,
}

impl Default for PoolNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolNotifier {
    /// Create a notifier with no subscribers
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe before reading the record, so a change in between is not missed
    pub fn subscribe(&self) -> broadcast::Receiver<RecordKey> {
        self.tx.subscribe()
    }

    /// Publish a change to the record `namespace/name`
    pub fn notify(&self, namespace: &str, name: &str) {
        // No receivers just means nobody is waiting
        let _ = self.tx.send((namespace.to_string(), name.to_string()));
    }

    /// Resolves once `key` changes.
    ///
    /// A lagged receiver may have skipped the change, so it resolves too and
    /// lets the caller read the record again. A closed channel never resolves.
    pub async fn changed(rx: &mut broadcast::Receiver<RecordKey>, key: &RecordKey) {
        loop {
            match rx.recv().await {
                Ok(changed) if &changed == key => return,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Missed {} StaticIP notifications", skipped);
                    return;
                }
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}

/// Watch StaticIP records and publish every applied one to `notifier`.
pub async fn watch_static_ips(api: Api<StaticIP>, notifier: PoolNotifier) -> Result<(), CniServerError> {
    info!("Starting StaticIP watcher");
    let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff().applied_objects());
    while let Some(result) = stream.next().await {
        match result {
            Ok(sip) => {
                let namespace = sip.metadata.namespace.as_deref().unwrap_or("default");
                if let Some(name) = sip.metadata.name.as_deref() {
                    notifier.notify(namespace, name);
                }
            }
            Err(e) => warn!("StaticIP watch error: {}", e),
        }
    }
    Err(CniServerError::Watch("StaticIP watch stream ended".to_string()))
}
