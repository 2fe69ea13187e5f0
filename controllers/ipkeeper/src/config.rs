//! Controller configuration
//!
//! Everything is read from the environment. `POD_NAME` and `POD_NS` come from
//! the downward API and identify this replica in the leadership lock.

use std::time::Duration;

use crate::error::ControllerError;

const DEFAULT_LEASE_DURATION_SECONDS: u64 = 8;
const DEFAULT_RENEW_DEADLINE_SECONDS: u64 = 4;
const DEFAULT_RETRY_PERIOD_SECONDS: u64 = 2;
const DEFAULT_QUEUE_MAX_RETRIES: u32 = 5;

/// Runtime configuration for the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Lock holder identity (`POD_NAME`)
    pub identity: String,
    /// Namespace the lock lives in (`POD_NS`)
    pub lock_namespace: String,
    /// Namespace to watch, all namespaces when unset
    pub watch_namespace: Option<String>,
    /// How long a lock stays valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before stepping down
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
    /// Failed attempts per queue item before it is dropped
    pub queue_max_retries: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    ControllerError::InvalidConfig(format!("{key} environment variable is required"))
                })
        };
        let number = |key: &str, default: u64| -> Result<u64, ControllerError> {
            match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
                None => Ok(default),
                Some(raw) => raw.parse::<u64>().map_err(|e| {
                    ControllerError::InvalidConfig(format!("{key}={raw} is not a number: {e}"))
                }),
            }
        };

        let identity = required("POD_NAME")?;
        let lock_namespace = required("POD_NS")?;
        let watch_namespace = lookup("WATCH_NAMESPACE")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let lease = number("LEASE_DURATION_SECONDS", DEFAULT_LEASE_DURATION_SECONDS)?;
        let renew = number("RENEW_DEADLINE_SECONDS", DEFAULT_RENEW_DEADLINE_SECONDS)?;
        let retry = number("RETRY_PERIOD_SECONDS", DEFAULT_RETRY_PERIOD_SECONDS)?;
        let max_retries = number("QUEUE_MAX_RETRIES", u64::from(DEFAULT_QUEUE_MAX_RETRIES))?;

        if retry == 0 {
            return Err(ControllerError::InvalidConfig(
                "RETRY_PERIOD_SECONDS must be greater than zero".to_string(),
            ));
        }
        if renew >= lease {
            return Err(ControllerError::InvalidConfig(format!(
                "RENEW_DEADLINE_SECONDS ({renew}) must be less than LEASE_DURATION_SECONDS ({lease})"
            )));
        }
        if retry >= renew {
            return Err(ControllerError::InvalidConfig(format!(
                "RETRY_PERIOD_SECONDS ({retry}) must be less than RENEW_DEADLINE_SECONDS ({renew})"
            )));
        }
        let queue_max_retries = u32::try_from(max_retries).map_err(|_| {
            ControllerError::InvalidConfig(format!("QUEUE_MAX_RETRIES={max_retries} is too large"))
        })?;

        Ok(Self {
            identity,
            lock_namespace,
            watch_namespace,
            lease_duration: Duration::from_secs(lease),
            renew_deadline: Duration::from_secs(renew),
            retry_period: Duration::from_secs(retry),
            queue_max_retries,
        })
    }
}
