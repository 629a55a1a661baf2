mod helpers;

use helpers::*;
use peerpod_core::models::{MessageBody, Ownership, PropagationMessage, QuickUpdate, RecordPatch};
use peerpod_core::AppError;
use peerpod_infra::InboundOutcome;
use std::sync::Arc;
use uuid::Uuid;

struct Federation {
    a: TestPod,
    b: TestPod,
    /// Id of pod-b in pod-a's registry.
    b_on_a: i64,
    /// Id of pod-a in pod-b's registry.
    a_on_b: i64,
}

async fn federation() -> Federation {
    let loopback = Arc::new(LoopbackTransport::default());
    let a = build_pod(PodOptions::new("pod-a", loopback.clone()));
    let b = build_pod(PodOptions::new("pod-b", loopback.clone()));
    loopback.connect("pod-a", a.inbound.clone());
    loopback.connect("pod-b", b.inbound.clone());

    let b_on_a = a.befriend("pod-b").await.id;
    let a_on_b = b.befriend("pod-a").await.id;
    a.start().await;
    b.start().await;

    Federation {
        a,
        b,
        b_on_a,
        a_on_b,
    }
}

#[tokio::test]
async fn test_record_lifecycle_replicates_to_peer() {
    let fed = federation().await;

    let record = fed
        .a
        .orchestrator
        .create_record(create_request("Shared clip"), upload(".mp4"), owner())
        .await
        .unwrap();
    let uuid = record.uuid;

    eventually(|| fed.b.store.record(uuid).is_some()).await;
    let replica = fed.b.store.record(uuid).unwrap();
    assert_eq!(replica.ownership, Ownership::Remote);
    assert_eq!(replica.origin_pod_id, Some(fed.a_on_b));
    assert_eq!(replica.name, "Shared clip");
    assert_eq!(replica.author_name, "alice");
    assert_eq!(replica.sequence, 1);
    assert!(fed.b.store.pod(fed.a_on_b).unwrap().last_seen_at.is_some());

    // A view on the replica is counted by the owner, which pushes the new total back.
    fed.b.orchestrator.view_record(uuid).await.unwrap();
    eventually(|| fed.a.store.record(uuid).map(|r| r.views) == Some(1)).await;
    eventually(|| fed.b.store.record(uuid).map(|r| r.views) == Some(1)).await;
    assert_eq!(fed.b.store.replica_sequence(fed.a_on_b, uuid), Some(2));
    assert_eq!(fed.a.store.replica_sequence(fed.b_on_a, uuid), Some(1));

    fed.a
        .orchestrator
        .update_record(
            uuid,
            RecordPatch {
                name: Some("Renamed clip".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    eventually(|| fed.b.store.record(uuid).map(|r| r.name) == Some("Renamed clip".to_string()))
        .await;
    assert_eq!(fed.b.store.record(uuid).unwrap().views, 1);

    fed.a.orchestrator.delete_record(uuid).await.unwrap();
    eventually(|| fed.b.store.record(uuid).is_none()).await;
    eventually(|| fed.a.store.outbox_for(fed.b_on_a).is_empty()).await;

    fed.a.shutdown().await;
    fed.b.shutdown().await;
}

#[tokio::test]
async fn test_friendship_is_not_retroactive() {
    let loopback = Arc::new(LoopbackTransport::default());
    let a = build_pod(PodOptions::new("pod-a", loopback.clone()));
    let b = build_pod(PodOptions::new("pod-b", loopback.clone()));
    loopback.connect("pod-b", b.inbound.clone());
    a.start().await;

    let before = a
        .orchestrator
        .create_record(create_request("before"), upload(".mp4"), owner())
        .await
        .unwrap();

    a.befriend("pod-b").await;
    b.befriend("pod-a").await;

    let after = a
        .orchestrator
        .create_record(create_request("after"), upload(".mp4"), owner())
        .await
        .unwrap();

    eventually(|| b.store.record(after.uuid).is_some()).await;
    assert!(b.store.record(before.uuid).is_none());

    a.shutdown().await;
}

#[tokio::test]
async fn test_stale_messages_are_discarded() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    let owner_pod = pod.befriend("pod-a").await;
    let uuid = Uuid::new_v4();

    let (body, sig) = signed(&full_record_message("pod-a", uuid, 5, "v5"));
    let outcome = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Applied);

    let (body, sig) = signed(&full_record_message("pod-a", uuid, 3, "v3"));
    let outcome = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Discarded);

    let stale_update = PropagationMessage {
        origin: "pod-a".to_string(),
        sequence: 5,
        record_uuid: uuid,
        body: MessageBody::QuickUpdate(QuickUpdate::views(99)),
    };
    let (body, sig) = signed(&stale_update);
    let outcome = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Discarded);

    let replica = pod.store.record(uuid).unwrap();
    assert_eq!(replica.name, "v5");
    assert_eq!(replica.views, 0);
    assert_eq!(replica.sequence, 5);
    assert_eq!(pod.store.replica_sequence(owner_pod.id, uuid), Some(5));
}

#[tokio::test]
async fn test_quick_update_for_unknown_replica_is_discarded() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    let owner_pod = pod.befriend("pod-a").await;
    let uuid = Uuid::new_v4();

    let update = PropagationMessage {
        origin: "pod-a".to_string(),
        sequence: 4,
        record_uuid: uuid,
        body: MessageBody::QuickUpdate(QuickUpdate::views(10)),
    };
    let (body, sig) = signed(&update);
    let outcome = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Discarded);
    assert!(pod.store.record(uuid).is_none());
    assert_eq!(pod.store.replica_sequence(owner_pod.id, uuid), None);

    // The full record that arrives later still lands.
    let (body, sig) = signed(&full_record_message("pod-a", uuid, 2, "late"));
    let outcome = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Applied);
}

#[tokio::test]
async fn test_remove_deletes_replica() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    pod.befriend("pod-a").await;
    let uuid = Uuid::new_v4();

    let (body, sig) = signed(&full_record_message("pod-a", uuid, 1, "doomed"));
    pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();

    let remove = PropagationMessage {
        origin: "pod-a".to_string(),
        sequence: 2,
        record_uuid: uuid,
        body: MessageBody::Remove,
    };
    let (body, sig) = signed(&remove);
    let outcome = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Applied);
    assert!(pod.store.record(uuid).is_none());

    // A redelivered full record from before the removal does not resurrect it.
    let (body, sig) = signed(&full_record_message("pod-a", uuid, 1, "doomed"));
    let outcome = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Discarded);
    assert!(pod.store.record(uuid).is_none());
}

#[tokio::test]
async fn test_unauthenticated_messages_are_rejected() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    pod.befriend("pod-a").await;
    let uuid = Uuid::new_v4();

    let (body, sig) = signed(&full_record_message("pod-x", uuid, 1, "stranger"));
    let err = pod.inbound.accept("pod-x", Some(&sig), &body).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let (body, _) = signed(&full_record_message("pod-a", uuid, 1, "forged"));
    let err = pod
        .inbound
        .accept("pod-a", Some("v1=00ff"), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let err = pod.inbound.accept("pod-a", None, &body).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    // Signed with pod-a's secret but claiming another origin.
    let (body, sig) = signed(&full_record_message("pod-c", uuid, 1, "spoofed"));
    let err = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    assert!(pod.store.record(uuid).is_none());
}

#[tokio::test]
async fn test_peers_cannot_overwrite_each_others_records() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    pod.befriend("pod-a").await;
    pod.befriend("pod-c").await;
    let uuid = Uuid::new_v4();

    let (body, sig) = signed(&full_record_message("pod-a", uuid, 1, "from a"));
    pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();

    let (body, sig) = signed(&full_record_message("pod-c", uuid, 9, "from c"));
    let err = pod.inbound.accept("pod-c", Some(&sig), &body).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));
    assert_eq!(pod.store.record(uuid).unwrap().name, "from a");

    // Nor can they push state onto records owned here.
    let local = pod
        .orchestrator
        .create_record(create_request("mine"), upload(".mp4"), owner())
        .await
        .unwrap();
    let (body, sig) = signed(&full_record_message("pod-a", local.uuid, 7, "hijack"));
    let err = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(pod.store.record(local.uuid).unwrap().name, "mine");
}

#[tokio::test]
async fn test_malformed_messages_are_rejected() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    pod.befriend("pod-a").await;

    let body = b"{not json".to_vec();
    let sig = peerpod_infra::federation::signature::sign(&body, SHARED_SECRET).unwrap();
    let err = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let (body, sig) = signed(&full_record_message("pod-a", Uuid::new_v4(), 0, "zero"));
    let err = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let mut mismatched = full_record_message("pod-a", Uuid::new_v4(), 1, "mismatch");
    mismatched.record_uuid = Uuid::new_v4();
    let (body, sig) = signed(&mismatched);
    let err = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    assert!(pod.store.records().is_empty());
}

#[tokio::test]
async fn test_blacklist_follows_the_replica() {
    let pod = build_pod(PodOptions::new("pod-b", recording_transport()));
    let owner_pod = pod.befriend("pod-a").await;
    let uuid = Uuid::new_v4();

    let (body, sig) = signed(&full_record_message("pod-a", uuid, 1, "unwanted"));
    pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert!(pod.orchestrator.blacklist_record(uuid).await.unwrap());

    // A newer version from the owner still lands but stays hidden.
    let (body, sig) = signed(&full_record_message("pod-a", uuid, 2, "still unwanted"));
    let outcome = pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert_eq!(outcome, InboundOutcome::Applied);
    assert_eq!(pod.store.record(uuid).unwrap().name, "still unwanted");
    assert!(pod.store.blacklisted(uuid));
    assert!(matches!(
        pod.orchestrator.view_record(uuid).await,
        Err(AppError::NotFound(_))
    ));
    assert!(pod.queued(owner_pod.id).is_empty());

    let remove = PropagationMessage {
        origin: "pod-a".to_string(),
        sequence: 3,
        record_uuid: uuid,
        body: MessageBody::Remove,
    };
    let (body, sig) = signed(&remove);
    pod.inbound.accept("pod-a", Some(&sig), &body).await.unwrap();
    assert!(pod.store.record(uuid).is_none());
    assert!(!pod.store.blacklisted(uuid));
}
