//! Test utilities for unit testing the watcher intake and reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;

use crds::{GATEWAY_ANNOTATION, IP_POOL_ANNOTATION, OwnerKind, OwnerPod, PoolDeclaration, StaticIP};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube_runtime::reflector::{self, Store};
use kube_runtime::watcher;
use staticip::{ClusterClientTrait, MockClusterClient, pool};

use crate::reconciler::Reconciler;

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_GATEWAY: &str = "10.0.0.254";

fn owner_ref(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: if kind == "Deployment" || kind == "ReplicaSet" {
            "apps/v1".to_string()
        } else {
            "v1".to_string()
        },
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("{name}-uid"),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Helper to create a test Deployment, annotated when `pool` is set
pub fn create_test_deployment(name: &str, pool: Option<&str>, resource_version: &str) -> Deployment {
    let mut annotations = BTreeMap::new();
    if let Some(pool) = pool {
        annotations.insert(IP_POOL_ANNOTATION.to_string(), pool.to_string());
        annotations.insert(GATEWAY_ANNOTATION.to_string(), TEST_GATEWAY.to_string());
    }
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            uid: Some(format!("{name}-uid")),
            resource_version: Some(resource_version.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to create a test ReplicaSet owned by a Deployment
pub fn create_test_replica_set(name: &str, deployment: &str) -> ReplicaSet {
    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            uid: Some(format!("{name}-uid")),
            owner_references: Some(vec![owner_ref("Deployment", deployment)]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to create a test Pod with an optional owner of the given kind
pub fn create_test_pod(name: &str, uid: &str, owner: Option<(&str, &str)>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            uid: Some(uid.to_string()),
            owner_references: owner.map(|(kind, name)| vec![owner_ref(kind, name)]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to create a Deployment's StaticIP with the given pods already holding addresses
pub fn create_test_static_ip(deployment: &str, pool: &str, holders: &[&OwnerPod]) -> StaticIP {
    let decl = PoolDeclaration {
        pool: pool.to_string(),
        gateway: TEST_GATEWAY.to_string(),
    };
    let mut sip = pool::new_static_ip(
        TEST_NAMESPACE,
        OwnerKind::Deployment,
        deployment,
        &format!("{deployment}-uid"),
        &decl,
    )
    .expect("valid test pool");
    for holder in holders {
        pool::acquire(&mut sip.spec, holder).expect("test pool has room");
    }
    sip
}

/// Reflector store pre-filled with `deployments`
pub fn deployment_store(deployments: Vec<Deployment>) -> Store<Deployment> {
    let (store, mut writer) = reflector::store();
    for deploy in deployments {
        writer.apply_watcher_event(&watcher::Event::Apply(deploy));
    }
    store
}

/// Reconciler over a mock client and a store holding `deployments`
pub fn create_test_reconciler(client: &MockClusterClient, deployments: Vec<Deployment>) -> Reconciler {
    let cluster: Arc<dyn ClusterClientTrait> = Arc::new(client.clone());
    Reconciler::new(cluster, deployment_store(deployments))
}
