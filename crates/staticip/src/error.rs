//! StaticIP engine errors

use thiserror::Error;

/// Errors produced by the allocation engine, the resolver and the store
#[derive(Debug, Error)]
pub enum StaticIpError {
    /// Object does not exist (or was deleted concurrently)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create raced with another creator
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// resourceVersion mismatch on replace
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Every address in the pool is held
    #[error("No more IP available in pool {0}")]
    PoolExhausted(String),

    /// Standalone pod without address and gateway annotations
    #[error("Pod {0} doesn't declare a static address")]
    NoAddressDeclared(String),

    /// Ownership chain is not Pod -> ReplicaSet -> Deployment
    #[error("Unsupported owner kind {kind} for pod {pod}")]
    UnsupportedOwnerKind {
        /// Kind found in the chain
        kind: String,
        /// Pod being resolved
        pod: String,
    },

    /// Pool declaration could not be parsed
    #[error("Invalid pool: {0}")]
    InvalidPool(String),

    /// Object is missing fields the engine relies on
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Any other Kubernetes API failure, considered transient
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),
}

impl StaticIpError {
    /// Outcomes that need no further action from the caller.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            StaticIpError::NotFound(_)
                | StaticIpError::NoAddressDeclared(_)
                | StaticIpError::UnsupportedOwnerKind { .. }
        )
    }
}

impl From<kube::Error> for StaticIpError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => StaticIpError::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StaticIpError::AlreadyExists(ae.message.clone())
            }
            kube::Error::Api(ae) if ae.code == 409 => StaticIpError::Conflict(ae.message.clone()),
            _ => StaticIpError::Kube(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_classification() {
        assert!(StaticIpError::NotFound("x".to_string()).is_benign());
        assert!(StaticIpError::NoAddressDeclared("x".to_string()).is_benign());
        assert!(
            StaticIpError::UnsupportedOwnerKind {
                kind: "StatefulSet".to_string(),
                pod: "x".to_string()
            }
            .is_benign()
        );
        assert!(!StaticIpError::PoolExhausted("x".to_string()).is_benign());
        assert!(!StaticIpError::Conflict("x".to_string()).is_benign());
    }
}
