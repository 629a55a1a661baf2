//! HTTP surface: the federation inbox and the health check.
//!
//! Run with: `cargo test -p peerpod-api --test router_test`

mod helpers;

use axum::body::Bytes;
use axum_test::TestServer;
use std::sync::Arc;
use uuid::Uuid;

use helpers::*;
use peerpod_api::{setup_routes, AppState};
use peerpod_core::constants::{FEDERATION_INBOX_PATH, ORIGIN_HEADER, SIGNATURE_HEADER};

fn server(pod: &TestPod) -> TestServer {
    let state = Arc::new(AppState {
        inbound: pod.inbound.clone(),
        broker: pod.broker.clone(),
        job_queue: pod.job_queue.clone(),
        pool: None,
    });
    TestServer::new(setup_routes(state).into_make_service()).expect("Failed to create test server")
}

#[tokio::test]
async fn test_inbox_applies_signed_message() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    pod.befriend("pod-a").await;
    let server = server(&pod);
    let uuid = Uuid::new_v4();

    let (body, sig) = signed(&full_record_message("pod-a", uuid, 1, "over http"));
    let response = server
        .post(FEDERATION_INBOX_PATH)
        .add_header(ORIGIN_HEADER, "pod-a")
        .add_header(SIGNATURE_HEADER, sig.clone())
        .add_header("Content-Type", "application/json")
        .bytes(Bytes::from(body.clone()))
        .await;
    assert_eq!(response.status_code(), 204);
    assert_eq!(pod.store.record(uuid).unwrap().name, "over http");

    // Redelivery is acknowledged the same way.
    let response = server
        .post(FEDERATION_INBOX_PATH)
        .add_header(ORIGIN_HEADER, "pod-a")
        .add_header(SIGNATURE_HEADER, sig)
        .bytes(Bytes::from(body))
        .await;
    assert_eq!(response.status_code(), 204);
}

#[tokio::test]
async fn test_inbox_rejects_unauthenticated_senders() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    pod.befriend("pod-a").await;
    let server = server(&pod);

    let (body, sig) = signed(&full_record_message("pod-a", Uuid::new_v4(), 1, "clip"));

    let response = server
        .post(FEDERATION_INBOX_PATH)
        .add_header(ORIGIN_HEADER, "pod-a")
        .add_header(SIGNATURE_HEADER, "v1=deadbeef")
        .bytes(Bytes::from(body.clone()))
        .await;
    assert_eq!(response.status_code(), 401);
    let data: serde_json::Value = response.json();
    assert_eq!(data["recoverable"], false);

    let response = server
        .post(FEDERATION_INBOX_PATH)
        .add_header(ORIGIN_HEADER, "pod-z")
        .add_header(SIGNATURE_HEADER, sig.clone())
        .bytes(Bytes::from(body.clone()))
        .await;
    assert_eq!(response.status_code(), 401);

    let response = server
        .post(FEDERATION_INBOX_PATH)
        .add_header(SIGNATURE_HEADER, sig)
        .bytes(Bytes::from(body))
        .await;
    assert_eq!(response.status_code(), 401);

    assert!(pod.store.records().is_empty());
}

#[tokio::test]
async fn test_inbox_rejects_malformed_messages() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    pod.befriend("pod-a").await;
    let server = server(&pod);

    let body = b"[1, 2, 3]".to_vec();
    let sig = peerpod_infra::federation::signature::sign(&body, SHARED_SECRET).unwrap();
    let response = server
        .post(FEDERATION_INBOX_PATH)
        .add_header(ORIGIN_HEADER, "pod-a")
        .add_header(SIGNATURE_HEADER, sig)
        .bytes(Bytes::from(body))
        .await;
    assert_eq!(response.status_code(), 400);
    let data: serde_json::Value = response.json();
    assert!(data["error"].as_str().is_some());

    // An event about a record this pod has never seen.
    let event = peerpod_core::models::PropagationMessage {
        origin: "pod-a".to_string(),
        sequence: 1,
        record_uuid: Uuid::new_v4(),
        body: peerpod_core::models::MessageBody::Event(peerpod_core::models::RecordEvent {
            event_type: peerpod_core::models::EventType::View,
            count: 1,
        }),
    };
    let (body, sig) = signed(&event);
    let response = server
        .post(FEDERATION_INBOX_PATH)
        .add_header(ORIGIN_HEADER, "pod-a")
        .add_header(SIGNATURE_HEADER, sig)
        .bytes(Bytes::from(body))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_health_reports_peer_count() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    pod.befriend("pod-a").await;
    pod.befriend("pod-c").await;
    let server = server(&pod);

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    let data: serde_json::Value = response.json();
    assert_eq!(data["status"], "healthy");
    assert_eq!(data["peers"], 2);
    assert!(data.get("database").is_none());
}
