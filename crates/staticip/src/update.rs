//! Read-mutate-replace under optimistic concurrency

use std::time::Duration;

use crds::StaticIP;
use tracing::{debug, warn};

use crate::client::ClusterClientTrait;
use crate::error::StaticIpError;

/// Conflict retries before giving up and handing the error to the caller's queue
pub const MAX_CONFLICT_RETRIES: u32 = 5;

const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

/// What a mutation decided to do with the record it was given
#[derive(Debug)]
pub enum Mutation<T> {
    /// Persist the mutated record, then return the value
    Write(T),
    /// Leave the record as stored and return the value
    Skip(T),
}

/// Fetches the StaticIP, applies `mutate` and replaces it guarded by the
/// fetched `resourceVersion`.
///
/// A conflict discards the mutated copy and starts over from a fresh read, so
/// `mutate` must be a pure function of the record it receives. Errors returned
/// by `mutate` abort without writing.
pub async fn update_with_retry<C, T, F>(
    client: &C,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<T, StaticIpError>
where
    C: ClusterClientTrait + ?Sized,
    F: FnMut(&mut StaticIP) -> Result<Mutation<T>, StaticIpError> + Send,
    T: Send,
{
    let mut attempt = 0;
    loop {
        let mut sip = client.get_static_ip(namespace, name).await?;
        let value = match mutate(&mut sip)? {
            Mutation::Skip(value) => return Ok(value),
            Mutation::Write(value) => value,
        };

        let violations = sip.spec.invariant_violations();
        if !violations.is_empty() {
            warn!(
                "StaticIP {}/{} is inconsistent after mutation: {}",
                namespace,
                name,
                violations.join("; ")
            );
        }

        match client.replace_static_ip(&sip).await {
            Ok(_) => return Ok(value),
            Err(StaticIpError::Conflict(msg)) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                debug!(
                    "Conflict updating StaticIP {}/{} (attempt {}): {}",
                    namespace, name, attempt, msg
                );
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
