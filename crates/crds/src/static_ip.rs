//! StaticIP CRD
//!
//! Tracks the address pool of one owner (a Deployment or a standalone Pod)
//! and which pod currently holds each address.

use std::collections::{BTreeMap, HashSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::references::OwnerPod;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "ipkeeper.generals.space",
    version = "v1",
    kind = "StaticIP",
    namespaced,
    shortname = "sip",
    printcolumn = r#"{"name":"Owner", "type":"string", "jsonPath":".spec.ownerKind"}"#,
    printcolumn = r#"{"name":"Ratio", "type":"string", "jsonPath":".spec.ratio"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StaticIPSpec {
    /// Namespace of the owner
    pub namespace: String,

    /// Kind of the owner this pool belongs to
    pub owner_kind: OwnerKind,

    /// Declared pool, comma-separated (e.g. "192.168.1.1/24,192.168.1.2/24")
    pub ip_pool: String,

    /// Gateway shared by every address in the pool
    pub gateway: String,

    /// Address to holder mapping; keys are exactly the pool entries
    #[serde(default, alias = "ipmap")]
    pub ip_map: BTreeMap<String, Option<OwnerPod>>,

    /// Addresses currently assigned, in assignment order
    #[serde(default)]
    pub used: Vec<String>,

    /// Free list, allocation takes from the front
    #[serde(default, alias = "avaliable")]
    pub available: Vec<String>,

    /// Assigned over total, e.g. "1/4"
    #[serde(default)]
    pub ratio: String,
}

/// Kind of resource a StaticIP is scoped to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
pub enum OwnerKind {
    /// Multi-replica workload; pods reach it through a ReplicaSet
    #[default]
    Deployment,

    /// Standalone pod with no controller
    Pod,
}

impl OwnerKind {
    /// Short prefix used in StaticIP names
    pub fn short_name(self) -> &'static str {
        match self {
            OwnerKind::Deployment => "deploy",
            OwnerKind::Pod => "pod",
        }
    }

    /// API version of the owning resource, for owner references
    pub fn api_version(self) -> &'static str {
        match self {
            OwnerKind::Deployment => "apps/v1",
            OwnerKind::Pod => "v1",
        }
    }

    /// Kind string of the owning resource
    pub fn as_str(self) -> &'static str {
        match self {
            OwnerKind::Deployment => "Deployment",
            OwnerKind::Pod => "Pod",
        }
    }
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the StaticIP that belongs to the given owner.
pub fn static_ip_name(kind: OwnerKind, owner_name: &str) -> String {
    format!("{}-{}", kind.short_name(), owner_name)
}

impl StaticIPSpec {
    /// Recomputes `ratio` from `used` and `ip_map`
    pub fn recompute_ratio(&mut self) {
        self.ratio = format!("{}/{}", self.used.len(), self.ip_map.len());
    }

    /// Address currently held by the pod with this uid
    pub fn address_of(&self, uid: &str) -> Option<&str> {
        self.used
            .iter()
            .find(|ip| {
                self.ip_map
                    .get(ip.as_str())
                    .and_then(Option::as_ref)
                    .is_some_and(|owner| owner.uid == uid)
            })
            .map(String::as_str)
    }

    /// Lists every bookkeeping invariant the record currently breaks.
    ///
    /// An empty result means `used` and `available` partition the keys of
    /// `ip_map` without duplicates, an address has a holder iff it is used,
    /// and `ratio` matches the counts.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        let mut seen = HashSet::new();
        for ip in &self.used {
            if !seen.insert(ip.as_str()) {
                violations.push(format!("{ip} listed more than once"));
            }
            match self.ip_map.get(ip) {
                None => violations.push(format!("used address {ip} is not in the pool")),
                Some(None) => violations.push(format!("used address {ip} has no holder")),
                Some(Some(_)) => {}
            }
        }
        for ip in &self.available {
            if !seen.insert(ip.as_str()) {
                violations.push(format!("{ip} listed more than once"));
            }
            match self.ip_map.get(ip) {
                None => violations.push(format!("available address {ip} is not in the pool")),
                Some(Some(owner)) => {
                    violations.push(format!("available address {ip} is held by {owner}"));
                }
                Some(None) => {}
            }
        }
        for ip in self.ip_map.keys() {
            if !seen.contains(ip.as_str()) {
                violations.push(format!("{ip} is neither used nor available"));
            }
        }

        let expected = format!("{}/{}", self.used.len(), self.ip_map.len());
        if self.ratio != expected {
            violations.push(format!("ratio is {} but should be {}", self.ratio, expected));
        }

        violations
    }
}
