//! Server configuration from the environment

use std::path::PathBuf;
use std::time::Duration;

use crate::error::CniServerError;

/// Socket the plugin connects to unless `BIND_SOCKET` says otherwise
pub const DEFAULT_BIND_SOCKET: &str = "/var/run/cniserver.sock";

const DEFAULT_ACQUIRE_TIMEOUT_SECONDS: u64 = 20;

/// Runtime configuration for the CNI server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Unix socket path (`BIND_SOCKET`)
    pub bind_socket: PathBuf,
    /// Longest an add request waits for its pool (`ACQUIRE_TIMEOUT_SECONDS`)
    pub acquire_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_socket: PathBuf::from(DEFAULT_BIND_SOCKET),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECONDS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, CniServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CniServerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(path) = value("BIND_SOCKET") {
            config.bind_socket = PathBuf::from(path);
        }
        if let Some(raw) = value("ACQUIRE_TIMEOUT_SECONDS") {
            let secs = raw.parse::<u64>().map_err(|e| {
                CniServerError::Configuration(format!("ACQUIRE_TIMEOUT_SECONDS={raw} is not a number: {e}"))
            })?;
            config.acquire_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}
