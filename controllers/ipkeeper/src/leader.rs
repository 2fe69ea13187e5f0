//! Leader election using a ConfigMap lock
//!
//! Only one controller replica may drive reconciliation. Replicas compete for
//! the ConfigMap `crd-ipkeeper` in their own namespace; the holder is recorded
//! as JSON in the `control-plane.alpha.kubernetes.io/leader` annotation.
//!
//! # Atomicity
//!
//! Every write is a create or a replace carrying the resourceVersion that was
//! read. If the lock changes between read and write the API server answers 409
//! and the attempt counts as lost, so two replicas can never both believe they
//! took the same term.
//!
//! Transitions are reported as [`LeadershipEvent`]s over a channel; the
//! supervisor owns what happens on each side of the transition.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ControllerError;

/// Name of the lock object
pub const LOCK_NAME: &str = "crd-ipkeeper";

/// Annotation holding the serialized [`LeaderRecord`]
pub const LEADER_ANNOTATION: &str = "control-plane.alpha.kubernetes.io/leader";

/// Leadership transitions reported to the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEvent {
    /// This replica now holds the lock
    Gained,
    /// This replica no longer holds the lock
    Lost,
}

/// Lock contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderRecord {
    /// Identity of the holder, empty once released
    pub holder_identity: String,
    /// Seconds the lock stays valid after `renew_time`
    pub lease_duration_seconds: u64,
    /// When the current holder took the lock
    pub acquire_time: DateTime<Utc>,
    /// Last successful renewal
    pub renew_time: DateTime<Utc>,
    /// Number of times the lock changed hands
    #[serde(default)]
    pub leader_transitions: u32,
}

impl LeaderRecord {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        let lease = i64::try_from(self.lease_duration_seconds).unwrap_or(i64::MAX);
        now > self.renew_time + chrono::Duration::seconds(lease)
    }
}

/// What an attempt should do with the lock it read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockDecision {
    /// No lock object yet
    Create,
    /// We hold it; refresh the renew time
    Renew,
    /// Released, expired or unreadable; take it
    TakeOver,
    /// Someone else holds a live lock
    HeldByOther(String),
}

/// Decide what to do with the current lock record.
///
/// `record` is `None` when the lock object exists but carries no readable
/// record. A missing lock object is the caller's [`LockDecision::Create`].
pub fn evaluate_lock(record: Option<&LeaderRecord>, identity: &str, now: DateTime<Utc>) -> LockDecision {
    match record {
        None => LockDecision::TakeOver,
        Some(r) if r.holder_identity == identity => LockDecision::Renew,
        Some(r) if r.holder_identity.is_empty() || r.expired_at(now) => LockDecision::TakeOver,
        Some(r) => LockDecision::HeldByOther(r.holder_identity.clone()),
    }
}

/// Record to write for a decision
pub fn next_record(
    decision: &LockDecision,
    previous: Option<&LeaderRecord>,
    identity: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
) -> LeaderRecord {
    let lease_duration_seconds = lease_duration.as_secs();
    match (decision, previous) {
        (LockDecision::Renew, Some(prev)) => LeaderRecord {
            holder_identity: identity.to_string(),
            lease_duration_seconds,
            acquire_time: prev.acquire_time,
            renew_time: now,
            leader_transitions: prev.leader_transitions,
        },
        (_, Some(prev)) => LeaderRecord {
            holder_identity: identity.to_string(),
            lease_duration_seconds,
            acquire_time: now,
            renew_time: now,
            leader_transitions: if prev.holder_identity == identity {
                prev.leader_transitions
            } else {
                prev.leader_transitions + 1
            },
        },
        (_, None) => LeaderRecord {
            holder_identity: identity.to_string(),
            lease_duration_seconds,
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        },
    }
}

fn read_record(cm: &ConfigMap) -> Option<LeaderRecord> {
    let raw = cm.metadata.annotations.as_ref()?.get(LEADER_ANNOTATION)?;
    match serde_json::from_str(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Ignoring unreadable leader record on {}: {}", LOCK_NAME, e);
            None
        }
    }
}

fn with_record(mut cm: ConfigMap, record: &LeaderRecord) -> Result<ConfigMap, ControllerError> {
    let raw = serde_json::to_string(record)?;
    cm.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(LEADER_ANNOTATION.to_string(), raw);
    Ok(cm)
}

/// Time one lock request may take.
///
/// A leader only has what is left of its renew deadline, so a stalled
/// request makes it step down before another replica can take the lock.
fn attempt_budget(leading: bool, since_renew: Duration, renew_deadline: Duration) -> Duration {
    if leading {
        renew_deadline.saturating_sub(since_renew)
    } else {
        renew_deadline
    }
}

/// Runs one lock request, failing it once `budget` has passed.
async fn bounded<F, T>(budget: Duration, request: F) -> Result<T, ControllerError>
where
    F: std::future::Future<Output = Result<T, ControllerError>>,
{
    tokio::time::timeout(budget, request)
        .await
        .unwrap_or_else(|_| Err(ControllerError::LockTimeout(budget)))
}

/// Leader elector backed by a ConfigMap
pub struct LeaderElector {
    api: Api<ConfigMap>,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Create an elector for this replica
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            api: Api::namespaced(client, &config.lock_namespace),
            identity: config.identity.clone(),
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
            retry_period: config.retry_period,
        }
    }

    /// One acquire-or-renew attempt; `Ok(true)` while we hold the lock
    async fn try_acquire_or_renew(&self) -> Result<bool, ControllerError> {
        let now = Utc::now();
        let existing = match self.api.get(LOCK_NAME).await {
            Ok(cm) => Some(cm),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let Some(cm) = existing else {
            let record = next_record(&LockDecision::Create, None, &self.identity, self.lease_duration, now);
            let cm = with_record(
                ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(LOCK_NAME.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                &record,
            )?;
            return match self.api.create(&PostParams::default(), &cm).await {
                Ok(_) => {
                    info!("Created leader lock {} as {}", LOCK_NAME, self.identity);
                    Ok(true)
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    debug!("Leader lock creation raced, will retry");
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            };
        };

        let previous = read_record(&cm);
        let decision = evaluate_lock(previous.as_ref(), &self.identity, now);
        if let LockDecision::HeldByOther(holder) = &decision {
            debug!("Leader lock held by {}", holder);
            return Ok(false);
        }

        let record = next_record(&decision, previous.as_ref(), &self.identity, self.lease_duration, now);
        let updated = with_record(cm, &record)?;
        match self.api.replace(LOCK_NAME, &PostParams::default(), &updated).await {
            Ok(_) => {
                if decision == LockDecision::TakeOver {
                    info!(
                        "Took over leader lock {} as {} (transitions: {})",
                        LOCK_NAME, self.identity, record.leader_transitions
                    );
                }
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("Leader lock changed while writing, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the holder so another replica can take over without waiting for expiry
    async fn release(&self) -> Result<(), ControllerError> {
        let cm = match self.api.get(LOCK_NAME).await {
            Ok(cm) => cm,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Some(mut record) = read_record(&cm) else {
            return Ok(());
        };
        if record.holder_identity != self.identity {
            return Ok(());
        }
        record.holder_identity = String::new();
        record.renew_time = Utc::now() - chrono::Duration::seconds(60);
        let updated = with_record(cm, &record)?;
        self.api.replace(LOCK_NAME, &PostParams::default(), &updated).await?;
        info!("Released leader lock {}", LOCK_NAME);
        Ok(())
    }

    /// Compete for the lock until `shutdown` fires, reporting transitions on `events`.
    ///
    /// While leading, the lock is renewed every retry period. If no renewal
    /// succeeds within the renew deadline, leadership is reported lost and the
    /// elector goes back to competing. On shutdown a held lock is released.
    pub async fn run(self, events: mpsc::Sender<LeadershipEvent>, mut shutdown: watch::Receiver<bool>) {
        info!("Competing for leader lock {} as {}", LOCK_NAME, self.identity);
        let mut leading = false;
        let mut last_renew = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let budget = attempt_budget(leading, last_renew.elapsed(), self.renew_deadline);
            match bounded(budget, self.try_acquire_or_renew()).await {
                Ok(true) => {
                    last_renew = Instant::now();
                    if !leading {
                        leading = true;
                        info!("Became leader as {}", self.identity);
                        if events.send(LeadershipEvent::Gained).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(false) if leading => {
                    leading = false;
                    warn!("Leader lock no longer held by {}, stepping down", self.identity);
                    if events.send(LeadershipEvent::Lost).await.is_err() {
                        break;
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Leader lock attempt failed: {}", e),
            }

            if leading && last_renew.elapsed() >= self.renew_deadline {
                leading = false;
                warn!("Failed to renew leader lock within {:?}, stepping down", self.renew_deadline);
                if events.send(LeadershipEvent::Lost).await.is_err() {
                    break;
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.retry_period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if leading {
            if let Err(e) = bounded(self.renew_deadline, self.release()).await {
                warn!("Failed to release leader lock: {}", e);
            }
        }
        debug!("Leader elector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
    }

    fn record(holder: &str, renewed: i64) -> LeaderRecord {
        LeaderRecord {
            holder_identity: holder.to_string(),
            lease_duration_seconds: 8,
            acquire_time: at(0),
            renew_time: at(renewed),
            leader_transitions: 3,
        }
    }

    #[test]
    fn test_leader_attempt_limited_to_remaining_deadline() {
        let deadline = Duration::from_secs(6);
        assert_eq!(attempt_budget(false, Duration::from_secs(30), deadline), deadline);
        assert_eq!(attempt_budget(true, Duration::from_secs(2), deadline), Duration::from_secs(4));
        assert_eq!(attempt_budget(true, Duration::from_secs(9), deadline), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_stalled_request_times_out() {
        let stalled = std::future::pending::<Result<bool, ControllerError>>();
        let result = bounded(Duration::from_millis(20), stalled).await;
        assert!(matches!(result, Err(ControllerError::LockTimeout(_))));

        let answered = bounded(Duration::from_secs(1), async { Ok(true) }).await;
        assert!(matches!(answered, Ok(true)));
    }

    #[test]
    fn test_own_lock_is_renewed() {
        let r = record("ipkeeper-0", 0);
        assert_eq!(evaluate_lock(Some(&r), "ipkeeper-0", at(100)), LockDecision::Renew);

        let next = next_record(&LockDecision::Renew, Some(&r), "ipkeeper-0", Duration::from_secs(8), at(100));
        assert_eq!(next.acquire_time, at(0));
        assert_eq!(next.renew_time, at(100));
        assert_eq!(next.leader_transitions, 3);
    }

    #[test]
    fn test_live_lock_of_other_is_respected() {
        let r = record("ipkeeper-1", 0);
        assert_eq!(
            evaluate_lock(Some(&r), "ipkeeper-0", at(8)),
            LockDecision::HeldByOther("ipkeeper-1".to_string())
        );
    }

    #[test]
    fn test_expired_or_released_lock_is_taken_over() {
        let r = record("ipkeeper-1", 0);
        assert_eq!(evaluate_lock(Some(&r), "ipkeeper-0", at(9)), LockDecision::TakeOver);

        let released = record("", 0);
        assert_eq!(evaluate_lock(Some(&released), "ipkeeper-0", at(1)), LockDecision::TakeOver);
        assert_eq!(evaluate_lock(None, "ipkeeper-0", at(1)), LockDecision::TakeOver);

        let next = next_record(&LockDecision::TakeOver, Some(&r), "ipkeeper-0", Duration::from_secs(8), at(9));
        assert_eq!(next.holder_identity, "ipkeeper-0");
        assert_eq!(next.acquire_time, at(9));
        assert_eq!(next.leader_transitions, 4);
    }

    #[test]
    fn test_first_record() {
        let next = next_record(&LockDecision::Create, None, "ipkeeper-0", Duration::from_secs(8), at(0));
        assert_eq!(next.leader_transitions, 0);
        assert_eq!(next.lease_duration_seconds, 8);
    }

    #[test]
    fn test_record_round_trips_through_annotation() {
        let r = record("ipkeeper-0", 5);
        let cm = with_record(ConfigMap::default(), &r).expect("serializable");
        let raw = cm
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LEADER_ANNOTATION))
            .expect("annotation set");
        assert!(raw.contains("\"holderIdentity\":\"ipkeeper-0\""));
        assert_eq!(read_record(&cm), Some(r));
    }

    #[test]
    fn test_unreadable_record_is_ignored() {
        let mut cm = ConfigMap::default();
        cm.metadata.annotations = Some(BTreeMap::from([(LEADER_ANNOTATION.to_string(), "{not json".to_string())]));
        assert_eq!(read_record(&cm), None);
    }
}
