//! Annotation contract
//!
//! Workloads opt into static addressing through annotations under the
//! `ipkeeper.generals.space` prefix. A Deployment declares a pool, a standalone
//! Pod declares its single address, and both must declare a gateway.

use std::collections::BTreeMap;

use crate::static_ip::OwnerKind;

/// Single address with mask for a standalone Pod, e.g. `192.168.0.1/24`.
pub const IP_ADDRESS_ANNOTATION: &str = "ipkeeper.generals.space/ip_address";

/// Gateway address, must be reachable from every address in the pool.
pub const GATEWAY_ANNOTATION: &str = "ipkeeper.generals.space/gateway";

/// Comma-separated address pool for a Deployment, e.g. `192.168.0.1/24,192.168.0.2/24`.
pub const IP_POOL_ANNOTATION: &str = "ipkeeper.generals.space/ip_pool";

/// Address declaration read from an owner's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDeclaration {
    /// Raw pool string (a single entry for a standalone Pod)
    pub pool: String,

    /// Gateway address
    pub gateway: String,
}

impl PoolDeclaration {
    /// Reads the declaration for an owner of the given kind.
    ///
    /// Returns `None` unless both the pool (or address) and the gateway
    /// annotations are present and non-empty.
    pub fn from_annotations(
        kind: OwnerKind,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> Option<Self> {
        let annotations = annotations?;
        let pool_key = match kind {
            OwnerKind::Deployment => IP_POOL_ANNOTATION,
            OwnerKind::Pod => IP_ADDRESS_ANNOTATION,
        };
        let pool = annotation_value(annotations, pool_key)?;
        let gateway = annotation_value(annotations, GATEWAY_ANNOTATION)?;
        Some(Self { pool, gateway })
    }
}

/// Returns the trimmed annotation value, treating blank values as absent.
pub fn annotation_value(annotations: &BTreeMap<String, String>, key: &str) -> Option<String> {
    annotations
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_deployment_declaration_requires_pool_and_gateway() {
        let full = annotations(&[
            (IP_POOL_ANNOTATION, "10.0.0.1/24,10.0.0.2/24"),
            (GATEWAY_ANNOTATION, "10.0.0.254"),
        ]);
        let decl = PoolDeclaration::from_annotations(OwnerKind::Deployment, Some(&full));
        assert_eq!(
            decl,
            Some(PoolDeclaration {
                pool: "10.0.0.1/24,10.0.0.2/24".to_string(),
                gateway: "10.0.0.254".to_string(),
            })
        );

        let no_gateway = annotations(&[(IP_POOL_ANNOTATION, "10.0.0.1/24")]);
        assert!(PoolDeclaration::from_annotations(OwnerKind::Deployment, Some(&no_gateway)).is_none());
        assert!(PoolDeclaration::from_annotations(OwnerKind::Deployment, None).is_none());
    }

    #[test]
    fn test_pod_declaration_reads_ip_address() {
        let pod = annotations(&[
            (IP_ADDRESS_ANNOTATION, "10.0.0.7/24"),
            (GATEWAY_ANNOTATION, "10.0.0.254"),
        ]);
        let decl = PoolDeclaration::from_annotations(OwnerKind::Pod, Some(&pod));
        assert_eq!(decl.map(|d| d.pool), Some("10.0.0.7/24".to_string()));

        // A pod annotated with a pool (not an address) declares nothing for itself
        let pool_only = annotations(&[
            (IP_POOL_ANNOTATION, "10.0.0.7/24"),
            (GATEWAY_ANNOTATION, "10.0.0.254"),
        ]);
        assert!(PoolDeclaration::from_annotations(OwnerKind::Pod, Some(&pool_only)).is_none());
    }

    #[test]
    fn test_blank_values_are_absent() {
        let blank = annotations(&[(IP_POOL_ANNOTATION, "  "), (GATEWAY_ANNOTATION, "10.0.0.254")]);
        assert!(PoolDeclaration::from_annotations(OwnerKind::Deployment, Some(&blank)).is_none());
    }
}
