//! Router and socket lifecycle tests

use super::*;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use crds::{GATEWAY_ANNOTATION, IP_ADDRESS_ANNOTATION};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use staticip::{ClusterClientTrait, MockClusterClient};
use tower::ServiceExt;

use crate::notify::PoolNotifier;

fn test_router(client: &MockClusterClient) -> Router {
    let cluster: Arc<dyn ClusterClientTrait> = Arc::new(client.clone());
    router(Arc::new(AddressAllocator::new(
        cluster,
        PoolNotifier::new(),
        Duration::from_millis(50),
    )))
}

fn standalone_pod(name: &str, address: Option<&str>) -> Pod {
    let annotations = address.map(|ip| {
        [
            (IP_ADDRESS_ANNOTATION.to_string(), ip.to_string()),
            (GATEWAY_ANNOTATION.to_string(), "10.0.0.254".to_string()),
        ]
        .into_iter()
        .collect()
    });
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("{name}-uid")),
            annotations,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    serde_json::from_slice(&body).expect("json body")
}

#[tokio::test]
async fn test_add_returns_declared_address() {
    let client = MockClusterClient::new();
    client.add_pod(standalone_pod("db", Some("10.0.0.9/24")));

    let response = test_router(&client)
        .oneshot(post(
            "/api/v1/add",
            r#"{"podName":"db","podNamespace":"default","containerId":"c1","netNs":"/proc/1/ns/net","cni0":"cni0"}"#,
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        serde_json::json!({"ipAddress": "10.0.0.9/24", "gateway": "10.0.0.254"})
    );
}

#[tokio::test]
async fn test_add_without_declaration_does_nothing() {
    let client = MockClusterClient::new();
    client.add_pod(standalone_pod("plain", None));

    let response = test_router(&client)
        .oneshot(post("/api/v1/add", r#"{"podName":"plain","podNamespace":"default"}"#))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!({"doNothing": true}));
}

#[tokio::test]
async fn test_backend_failure_is_server_error() {
    let client = MockClusterClient::new();

    let response = test_router(&client)
        .oneshot(post("/api/v1/add", r#"{"podName":"ghost","podNamespace":"default"}"#))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(body["error"].as_str().is_some_and(|msg| msg.contains("ghost")));
}

#[tokio::test]
async fn test_malformed_body_is_client_error() {
    let client = MockClusterClient::new();

    let response = test_router(&client)
        .oneshot(post("/api/v1/add", r#"{"podNamespace":"default"}"#))
        .await
        .expect("response");
    assert!(response.status().is_client_error());

    let response = test_router(&client)
        .oneshot(post("/api/v1/add", "not json"))
        .await
        .expect("response");
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_del_is_acknowledged() {
    let client = MockClusterClient::new();

    let response = test_router(&client)
        .oneshot(post("/api/v1/del", r#"{"podName":"db","podNamespace":"default"}"#))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_socket_replaced_and_removed() {
    let socket = std::env::temp_dir().join(format!("ipkeeper-cni-{}.sock", std::process::id()));
    std::fs::write(&socket, b"stale").expect("stale file");

    let client = MockClusterClient::new();
    let cluster: Arc<dyn ClusterClientTrait> = Arc::new(client);
    let allocator = Arc::new(AddressAllocator::new(cluster, PoolNotifier::new(), Duration::from_millis(50)));
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(CniServer::new(socket.clone(), allocator).serve(async move {
        let _ = stopped.await;
    }));

    // Wait for the listener to replace the stale file
    let mut bound = false;
    for _ in 0..50 {
        if tokio::net::UnixStream::connect(&socket).await.is_ok() {
            bound = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(bound, "server should listen on the socket");

    stop.send(()).expect("server running");
    server.await.expect("join").expect("clean shutdown");
    assert!(!socket.exists());
}
