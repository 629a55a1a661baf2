mod helpers;

use helpers::*;
use peerpod_core::models::{EventType, MessageBody, RecordPatch};
use peerpod_core::{AppError, ErrorMetadata};
use std::sync::Arc;
use uuid::Uuid;

fn pod_a() -> TestPod {
    build_pod(PodOptions::new("pod-a", recording_transport()))
}

#[tokio::test]
async fn test_create_queues_full_record_for_every_peer() {
    let pod = pod_a();
    let b = pod.befriend("pod-b").await;
    let c = pod.befriend("pod-c").await;

    let record = pod
        .orchestrator
        .create_record(create_request("Garden cat"), upload(".mp4"), owner())
        .await
        .unwrap();

    assert!(record.is_owned());
    assert_eq!(record.sequence, 1);
    assert_eq!(record.tags, vec!["cats".to_string(), "garden".to_string()]);
    assert_eq!(record.author_name, "alice");

    for peer in [b.id, c.id] {
        let queued = pod.queued(peer);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].origin, "pod-a");
        assert_eq!(queued[0].sequence, 1);
        assert_eq!(queued[0].record_uuid, record.uuid);
        match &queued[0].body {
            MessageBody::FullRecord(remote) => {
                assert_eq!(remote.name, "Garden cat");
                assert_eq!(remote.author, "alice");
            }
            other => panic!("expected FullRecord, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_create_rejects_invalid_input() {
    let pod = pod_a();

    let mut request = create_request("x");
    request.name = String::new();
    let err = pod
        .orchestrator
        .create_record(request, upload(".mp4"), owner())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = pod
        .orchestrator
        .create_record(create_request("clip"), upload("mp4"), owner())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(pod.store.records().is_empty());
}

#[tokio::test]
async fn test_update_bumps_sequence_and_propagates() {
    let pod = pod_a();
    let b = pod.befriend("pod-b").await;

    let created = pod
        .orchestrator
        .create_record(create_request("before"), upload(".mp4"), owner())
        .await
        .unwrap();

    let updated = pod
        .orchestrator
        .update_record(
            created.uuid,
            RecordPatch {
                name: Some("after".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.sequence, 2);
    assert_eq!(updated.name, "after");
    assert_eq!(updated.description, created.description);
    assert!(updated.updated_at > created.updated_at);

    let queued = pod.queued(b.id);
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[1].sequence, 2);
    match &queued[1].body {
        MessageBody::FullRecord(remote) => assert_eq!(remote.name, "after"),
        other => panic!("expected FullRecord, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_patch_is_rejected() {
    let pod = pod_a();
    let record = pod
        .orchestrator
        .create_record(create_request("clip"), upload(".mp4"), owner())
        .await
        .unwrap();

    let err = pod
        .orchestrator
        .update_record(record.uuid, RecordPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(pod.store.record(record.uuid).unwrap().sequence, 1);
}

#[tokio::test]
async fn test_remote_records_cannot_be_modified_locally() {
    let pod = pod_a();
    let b = pod.befriend("pod-b").await;
    let uuid = Uuid::new_v4();
    pod.store.seed_record(remote_record(uuid, b.id, 4));

    let err = pod
        .orchestrator
        .update_record(
            uuid,
            RecordPatch {
                name: Some("hijack".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = pod.orchestrator.delete_record(uuid).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = pod.orchestrator.mark_transcoded(uuid).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let stored = pod.store.record(uuid).unwrap();
    assert_eq!(stored.name, "seed");
    assert_eq!(stored.sequence, 4);
    assert!(pod.queued(b.id).is_empty());
}

#[tokio::test]
async fn test_missing_record_is_not_found() {
    let pod = pod_a();
    let err = pod
        .orchestrator
        .delete_record(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = pod
        .orchestrator
        .view_record(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_queues_remove_with_next_sequence() {
    let pod = pod_a();
    let b = pod.befriend("pod-b").await;
    let uuid = Uuid::new_v4();
    pod.store.seed_record(owned_record(uuid, 1, 3));

    pod.orchestrator.delete_record(uuid).await.unwrap();

    assert!(pod.store.record(uuid).is_none());
    let queued = pod.queued(b.id);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].body, MessageBody::Remove);
    assert_eq!(queued[0].sequence, 4);
}

#[tokio::test]
async fn test_owned_view_sends_absolute_counter() {
    let pod = pod_a();
    let b = pod.befriend("pod-b").await;
    let uuid = Uuid::new_v4();
    pod.store.seed_record(owned_record(uuid, 1, 1));

    let first = pod.orchestrator.view_record(uuid).await.unwrap();
    let second = pod.orchestrator.view_record(uuid).await.unwrap();
    assert_eq!(first.views, 1);
    assert_eq!(second.views, 2);

    let queued = pod.queued(b.id);
    assert_eq!(queued.len(), 2);
    let views: Vec<Option<i64>> = queued
        .iter()
        .map(|m| match &m.body {
            MessageBody::QuickUpdate(update) => update.views,
            other => panic!("expected QuickUpdate, got {:?}", other),
        })
        .collect();
    assert_eq!(views, vec![Some(1), Some(2)]);
    assert!(queued[0].sequence < queued[1].sequence);
}

#[tokio::test]
async fn test_remote_view_goes_to_owner_only() {
    let pod = pod_a();
    let owner_pod = pod.befriend("pod-b").await;
    let bystander = pod.befriend("pod-c").await;
    let uuid = Uuid::new_v4();
    pod.store.seed_record(remote_record(uuid, owner_pod.id, 5));

    let seen = pod.orchestrator.view_record(uuid).await.unwrap();
    pod.orchestrator.view_record(uuid).await.unwrap();

    assert_eq!(seen.views, 0);
    assert_eq!(pod.store.record(uuid).unwrap().views, 0);
    assert!(pod.queued(bystander.id).is_empty());

    let queued = pod.queued(owner_pod.id);
    assert_eq!(queued.len(), 2);
    assert_eq!(
        queued.iter().map(|m| m.sequence).collect::<Vec<_>>(),
        vec![1, 2]
    );
    for message in &queued {
        match &message.body {
            MessageBody::Event(event) => {
                assert_eq!(event.event_type, EventType::View);
                assert_eq!(event.count, 1);
            }
            other => panic!("expected Event, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_conflicts_are_retried_without_residue() {
    let pod = pod_a();
    let b = pod.befriend("pod-b").await;
    pod.store.inject_conflicts(3);

    let record = pod
        .orchestrator
        .create_record(create_request("retried"), upload(".mp4"), owner())
        .await
        .unwrap();

    assert_eq!(pod.store.commit_attempts(), 4);
    assert_eq!(pod.store.commits(), 1);
    assert_eq!(pod.store.records().len(), 1);
    assert_eq!(pod.store.authors().len(), 1);
    assert_eq!(pod.store.record(record.uuid).unwrap().sequence, 1);
    assert_eq!(pod.queued(b.id).len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_surface_as_unavailable() {
    let mut options = PodOptions::new("pod-a", recording_transport());
    options.tx_max_retries = 2;
    let pod = build_pod(options);
    let b = pod.befriend("pod-b").await;
    pod.store.inject_conflicts(10);

    let err = pod
        .orchestrator
        .create_record(create_request("doomed"), upload(".mp4"), owner())
        .await
        .unwrap_err();

    match &err {
        AppError::RetriesExhausted {
            message, attempts, ..
        } => {
            assert_eq!(message, "Failed to create record");
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(err.http_status_code(), 503);
    assert_eq!(pod.store.commits(), 0);
    assert!(pod.store.records().is_empty());
    assert!(pod.queued(b.id).is_empty());
}

#[tokio::test]
async fn test_get_record_reads_committed_state() {
    let pod = pod_a();
    assert!(pod
        .orchestrator
        .get_record(Uuid::new_v4())
        .await
        .unwrap()
        .is_none());

    let record = pod
        .orchestrator
        .create_record(create_request("clip"), upload(".webm"), owner())
        .await
        .unwrap();
    let loaded = pod.orchestrator.get_record(record.uuid).await.unwrap().unwrap();
    assert_eq!(loaded.extname, ".webm");
    assert_eq!(loaded.duration, 42);
}

#[tokio::test]
async fn test_transcode_job_commits_with_the_record() {
    let mut options = PodOptions::new("pod-a", recording_transport());
    options.transcoder = Some(Arc::new(FakeTranscoder::default()));
    options.tx_max_retries = 2;
    let pod = build_pod(options);
    let b = pod.befriend("pod-b").await;

    pod.store.inject_conflicts(2);
    let record = pod
        .orchestrator
        .create_record(create_request("retried"), upload(".webm"), owner())
        .await
        .unwrap();
    assert_eq!(pod.store.commit_attempts(), 3);
    let jobs = pod.store.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload["record_uuid"], record.uuid.to_string());
    assert!(pod.queued(b.id).is_empty());

    pod.store.inject_conflicts(10);
    pod.orchestrator
        .create_record(create_request("doomed"), upload(".webm"), owner())
        .await
        .unwrap_err();
    assert_eq!(pod.store.jobs().len(), 1);
    assert_eq!(pod.store.records().len(), 1);
}

#[tokio::test]
async fn test_blacklisted_replica_is_hidden() {
    let pod = pod_a();
    let owner_pod = pod.befriend("pod-b").await;
    let uuid = Uuid::new_v4();
    pod.store.seed_record(remote_record(uuid, owner_pod.id, 2));

    assert!(pod.orchestrator.blacklist_record(uuid).await.unwrap());
    assert!(pod.store.blacklisted(uuid));
    assert!(!pod.orchestrator.blacklist_record(uuid).await.unwrap());

    let err = pod.orchestrator.view_record(uuid).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(pod.queued(owner_pod.id).is_empty());

    // Local only: nothing is sent about the blacklist itself.
    assert!(pod.store.record(uuid).is_some());
    assert!(pod.store.outbox_for(owner_pod.id).is_empty());
}

#[tokio::test]
async fn test_only_replicas_can_be_blacklisted() {
    let pod = pod_a();
    let b = pod.befriend("pod-b").await;
    let uuid = Uuid::new_v4();
    pod.store.seed_record(owned_record(uuid, 1, 1));

    let err = pod.orchestrator.blacklist_record(uuid).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(!pod.store.blacklisted(uuid));
    assert_eq!(pod.orchestrator.view_record(uuid).await.unwrap().views, 1);
    assert_eq!(pod.queued(b.id).len(), 1);

    let err = pod
        .orchestrator
        .blacklist_record(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
