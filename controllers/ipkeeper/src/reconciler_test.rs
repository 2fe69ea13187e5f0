//! Unit tests for the StaticIP reconciler

use super::*;
use crate::test_utils::*;
use crds::IP_ADDRESS_ANNOTATION;
use staticip::MockClusterClient;

fn web_key() -> ObjectRef<Deployment> {
    ObjectRef::new("web").within(TEST_NAMESPACE)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[tokio::test]
async fn test_add_creates_record_owned_by_deployment() {
    let client = MockClusterClient::new();
    let deploy = create_test_deployment("web", Some("10.0.0.1/24,10.0.0.2/24"), "1");
    let reconciler = create_test_reconciler(&client, vec![deploy]);

    reconciler.handle_add_workload(&web_key()).await.expect("add succeeds");

    let sip = client.static_ip(TEST_NAMESPACE, "deploy-web").expect("record created");
    assert_eq!(sip.spec.available, strings(&["10.0.0.1/24", "10.0.0.2/24"]));
    assert!(sip.spec.used.is_empty());
    assert_eq!(sip.spec.gateway, TEST_GATEWAY);
    let owner = &sip.metadata.owner_references.expect("owner reference")[0];
    assert_eq!(owner.kind, "Deployment");
    assert_eq!(owner.uid, "web-uid");
}

#[tokio::test]
async fn test_add_keeps_existing_assignments() {
    let client = MockClusterClient::new();
    let holder = OwnerPod::new(TEST_NAMESPACE, "web-abc-1", "pa");
    client.add_static_ip(create_test_static_ip("web", "10.0.0.1/24,10.0.0.2/24", &[&holder]));
    let deploy = create_test_deployment("web", Some("10.0.0.1/24,10.0.0.2/24"), "1");
    let reconciler = create_test_reconciler(&client, vec![deploy]);

    reconciler.handle_add_workload(&web_key()).await.expect("existing record is fine");

    let sip = client.static_ip(TEST_NAMESPACE, "deploy-web").expect("record");
    assert_eq!(sip.spec.address_of("pa"), Some("10.0.0.1/24"));
    assert_eq!(client.replace_calls(), 0);
}

#[tokio::test]
async fn test_add_ignores_missing_or_invalid_deployments() {
    let client = MockClusterClient::new();
    let reconciler = create_test_reconciler(&client, vec![]);
    reconciler.handle_add_workload(&web_key()).await.expect("gone deployment");
    assert!(client.static_ip(TEST_NAMESPACE, "deploy-web").is_none());

    let bad = create_test_deployment("web", Some("10.0.0.300/24"), "1");
    let reconciler = create_test_reconciler(&client, vec![bad]);
    reconciler.handle_add_workload(&web_key()).await.expect("invalid pool is not retried");
    assert!(client.static_ip(TEST_NAMESPACE, "deploy-web").is_none());
}

#[tokio::test]
async fn test_update_shrinks_pool_and_evicts_holders() {
    let client = MockClusterClient::new();
    let pa = OwnerPod::new(TEST_NAMESPACE, "web-abc-1", "pa");
    let pb = OwnerPod::new(TEST_NAMESPACE, "web-abc-2", "pb");
    client.add_static_ip(create_test_static_ip(
        "web",
        "10.0.0.1/24,10.0.0.2/24,10.0.0.3/24",
        &[&pa, &pb],
    ));
    client.add_pod(create_test_pod("web-abc-1", "pa", Some(("ReplicaSet", "web-abc"))));
    client.add_pod(create_test_pod("web-abc-2", "pb", Some(("ReplicaSet", "web-abc"))));

    let deploy = create_test_deployment("web", Some("10.0.0.2/24,10.0.0.3/24,10.0.0.4/24"), "2");
    let reconciler = create_test_reconciler(&client, vec![deploy]);
    reconciler.handle_update_workload(&web_key()).await.expect("resize succeeds");

    let sip = client.static_ip(TEST_NAMESPACE, "deploy-web").expect("record");
    assert_eq!(sip.spec.ip_pool, "10.0.0.2/24,10.0.0.3/24,10.0.0.4/24");
    assert_eq!(sip.spec.address_of("pb"), Some("10.0.0.2/24"));
    assert_eq!(sip.spec.address_of("pa"), None);
    assert!(!sip.spec.ip_map.contains_key("10.0.0.1/24"));
    assert_eq!(sip.spec.available, strings(&["10.0.0.3/24", "10.0.0.4/24"]));
    assert!(sip.spec.invariant_violations().is_empty());
    assert_eq!(client.deleted_pods(), vec![pa]);
}

#[tokio::test]
async fn test_update_with_same_pool_does_not_write() {
    let client = MockClusterClient::new();
    client.add_static_ip(create_test_static_ip("web", "10.0.0.1/24,10.0.0.2/24", &[]));
    let deploy = create_test_deployment("web", Some("10.0.0.1/24,10.0.0.2/24"), "7");
    let reconciler = create_test_reconciler(&client, vec![deploy]);

    reconciler.handle_update_workload(&web_key()).await.expect("no-op");
    assert_eq!(client.replace_calls(), 0);
}

#[tokio::test]
async fn test_update_without_record_creates_it() {
    let client = MockClusterClient::new();
    let deploy = create_test_deployment("web", Some("10.0.0.1/24"), "3");
    let reconciler = create_test_reconciler(&client, vec![deploy]);

    reconciler.handle_update_workload(&web_key()).await.expect("falls back to create");
    let sip = client.static_ip(TEST_NAMESPACE, "deploy-web").expect("record created");
    assert_eq!(sip.spec.available, strings(&["10.0.0.1/24"]));
}

#[tokio::test]
async fn test_update_survives_failed_eviction() {
    let client = MockClusterClient::new();
    let pa = OwnerPod::new(TEST_NAMESPACE, "web-abc-1", "pa");
    client.add_static_ip(create_test_static_ip("web", "10.0.0.1/24,10.0.0.2/24", &[&pa]));
    client.add_pod(create_test_pod("web-abc-1", "pa", Some(("ReplicaSet", "web-abc"))));
    client.fail_delete_for("pa");

    let deploy = create_test_deployment("web", Some("10.0.0.2/24"), "4");
    let reconciler = create_test_reconciler(&client, vec![deploy]);
    reconciler.handle_update_workload(&web_key()).await.expect("record written regardless");

    let sip = client.static_ip(TEST_NAMESPACE, "deploy-web").expect("record");
    assert_eq!(sip.spec.available, strings(&["10.0.0.2/24"]));
    assert!(client.deleted_pods().is_empty());
}

#[tokio::test]
async fn test_update_retries_conflicts() {
    let client = MockClusterClient::new();
    client.add_static_ip(create_test_static_ip("web", "10.0.0.1/24", &[]));
    client.inject_conflicts(2);
    let deploy = create_test_deployment("web", Some("10.0.0.1/24,10.0.0.2/24"), "5");
    let reconciler = create_test_reconciler(&client, vec![deploy]);

    reconciler.handle_update_workload(&web_key()).await.expect("grow succeeds");
    let sip = client.static_ip(TEST_NAMESPACE, "deploy-web").expect("record");
    assert_eq!(sip.spec.available, strings(&["10.0.0.1/24", "10.0.0.2/24"]));
    assert_eq!(client.replace_calls(), 3);
}

#[tokio::test]
async fn test_update_releases_holders_that_no_longer_exist() {
    let client = MockClusterClient::new();
    let pa = OwnerPod::new(TEST_NAMESPACE, "web-abc-1", "pa");
    let pb = OwnerPod::new(TEST_NAMESPACE, "web-abc-2", "pb");
    let pc = OwnerPod::new(TEST_NAMESPACE, "web-abc-3", "pc");
    let pool_str = "10.0.0.1/24,10.0.0.2/24,10.0.0.3/24";
    client.add_static_ip(create_test_static_ip("web", pool_str, &[&pa, &pb, &pc]));
    client.add_pod(create_test_pod("web-abc-1", "pa", Some(("ReplicaSet", "web-abc"))));
    // pb was deleted while no replica was leading; web-abc-3 came back as a new instance
    client.add_pod(create_test_pod("web-abc-3", "pc-2", Some(("ReplicaSet", "web-abc"))));

    let deploy = create_test_deployment("web", Some(pool_str), "1");
    let reconciler = create_test_reconciler(&client, vec![deploy]);
    reconciler.handle_update_workload(&web_key()).await.expect("sweep succeeds");

    let sip = client.static_ip(TEST_NAMESPACE, "deploy-web").expect("record");
    assert_eq!(sip.spec.address_of("pa"), Some("10.0.0.1/24"));
    assert_eq!(sip.spec.address_of("pb"), None);
    assert_eq!(sip.spec.address_of("pc"), None);
    assert_eq!(sip.spec.available, strings(&["10.0.0.2/24", "10.0.0.3/24"]));
    assert!(sip.spec.invariant_violations().is_empty());
    assert!(client.deleted_pods().is_empty());

    // Every remaining holder exists, so a second pass writes nothing
    let writes = client.replace_calls();
    let released = reconciler
        .release_vanished_holders(TEST_NAMESPACE, "deploy-web")
        .await
        .expect("sweep succeeds");
    assert_eq!(released, 0);
    assert_eq!(client.replace_calls(), writes);
}

#[tokio::test]
async fn test_delete_pod_returns_address_to_tail() {
    let client = MockClusterClient::new();
    let pa = OwnerPod::new(TEST_NAMESPACE, "web-abc-1", "pa");
    client.add_static_ip(create_test_static_ip("web", "10.0.0.1/24,10.0.0.2/24", &[&pa]));
    client.add_replica_set(create_test_replica_set("web-abc", "web"));
    let reconciler = create_test_reconciler(&client, vec![]);

    let pod = create_test_pod("web-abc-1", "pa", Some(("ReplicaSet", "web-abc")));
    reconciler.handle_delete_pod(&pod).await.expect("release succeeds");

    let sip = client.static_ip(TEST_NAMESPACE, "deploy-web").expect("record");
    assert!(sip.spec.used.is_empty());
    assert_eq!(sip.spec.available, strings(&["10.0.0.2/24", "10.0.0.1/24"]));
    assert_eq!(sip.spec.ip_map.get("10.0.0.1/24"), Some(&None));

    // A second delivery finds nothing to release and writes nothing
    let writes = client.replace_calls();
    reconciler.handle_delete_pod(&pod).await.expect("idempotent");
    assert_eq!(client.replace_calls(), writes);
}

#[tokio::test]
async fn test_delete_pod_with_unsupported_owner_is_ignored() {
    let client = MockClusterClient::new();
    let reconciler = create_test_reconciler(&client, vec![]);

    let pod = create_test_pod("db-0", "p0", Some(("StatefulSet", "db")));
    reconciler.handle_delete_pod(&pod).await.expect("nothing to do");
    assert_eq!(client.replace_calls(), 0);
}

#[tokio::test]
async fn test_delete_pod_without_record_is_ignored() {
    let client = MockClusterClient::new();
    client.add_replica_set(create_test_replica_set("web-abc", "web"));
    let reconciler = create_test_reconciler(&client, vec![]);

    let pod = create_test_pod("web-abc-1", "pa", Some(("ReplicaSet", "web-abc")));
    reconciler.handle_delete_pod(&pod).await.expect("record already gone");

    // The replica set itself being gone is equally benign
    let orphan = create_test_pod("api-xyz-1", "px", Some(("ReplicaSet", "api-xyz")));
    reconciler.handle_delete_pod(&orphan).await.expect("replica set already gone");
}

#[tokio::test]
async fn test_delete_standalone_pod_releases_declared_address() {
    let client = MockClusterClient::new();
    let holder = OwnerPod::new(TEST_NAMESPACE, "db", "db-uid");
    let decl = PoolDeclaration {
        pool: "10.0.0.9/24".to_string(),
        gateway: TEST_GATEWAY.to_string(),
    };
    let mut sip = pool::new_static_ip(TEST_NAMESPACE, OwnerKind::Pod, "db", "db-uid", &decl).expect("valid");
    pool::claim_all(&mut sip.spec, &holder);
    client.add_static_ip(sip);
    let reconciler = create_test_reconciler(&client, vec![]);

    let mut pod = create_test_pod("db", "db-uid", None);
    pod.metadata.annotations = Some(
        [
            (IP_ADDRESS_ANNOTATION.to_string(), "10.0.0.9/24".to_string()),
            (crds::GATEWAY_ANNOTATION.to_string(), TEST_GATEWAY.to_string()),
        ]
        .into_iter()
        .collect(),
    );
    reconciler.handle_delete_pod(&pod).await.expect("release succeeds");

    let sip = client.static_ip(TEST_NAMESPACE, "pod-db").expect("record");
    assert_eq!(sip.spec.available, strings(&["10.0.0.9/24"]));
}

#[tokio::test]
async fn test_delete_pod_surfaces_persistent_conflicts() {
    let client = MockClusterClient::new();
    let pa = OwnerPod::new(TEST_NAMESPACE, "web-abc-1", "pa");
    client.add_static_ip(create_test_static_ip("web", "10.0.0.1/24", &[&pa]));
    client.add_replica_set(create_test_replica_set("web-abc", "web"));
    client.inject_conflicts(staticip::update::MAX_CONFLICT_RETRIES + 1);
    let reconciler = create_test_reconciler(&client, vec![]);

    let pod = create_test_pod("web-abc-1", "pa", Some(("ReplicaSet", "web-abc")));
    let err = reconciler.handle_delete_pod(&pod).await.expect_err("queue should retry");
    assert!(matches!(err, ControllerError::StaticIp(StaticIpError::Conflict(_))));
}
