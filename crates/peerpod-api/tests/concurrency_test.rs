mod helpers;

use helpers::*;
use peerpod_core::models::{MessageBody, RecordPatch};
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn test_concurrent_updates_serialize() {
    let pod = build_pod(PodOptions::new("pod-a", recording_transport()));
    let b = pod.befriend("pod-b").await;
    let uuid = Uuid::new_v4();
    pod.store.seed_record(owned_record(uuid, 1, 1));
    pod.store.hold_commits(2);

    let rename = pod.orchestrator.update_record(
        uuid,
        RecordPatch {
            name: Some("renamed".to_string()),
            ..Default::default()
        },
    );
    let describe = pod.orchestrator.update_record(
        uuid,
        RecordPatch {
            description: Some("now with a description".to_string()),
            ..Default::default()
        },
    );
    let (renamed, described) = tokio::join!(rename, describe);
    let renamed = renamed.unwrap();
    let described = described.unwrap();

    let mut sequences = vec![renamed.sequence, described.sequence];
    sequences.sort();
    assert_eq!(sequences, vec![2, 3]);

    // The later commit re-read the earlier one, so neither change is lost.
    let stored = pod.store.record(uuid).unwrap();
    assert_eq!(stored.sequence, 3);
    assert_eq!(stored.name, "renamed");
    assert_eq!(stored.description, "now with a description");
    assert!(pod.store.commit_attempts() > pod.store.commits());

    // Queue order is commit order.
    let queued = pod.queued(b.id);
    let queued_sequences: Vec<i64> = queued.iter().map(|m| m.sequence).collect();
    assert_eq!(queued_sequences, vec![2, 3]);

    match &queued[1].body {
        MessageBody::FullRecord(remote) => {
            assert_eq!(remote.name, "renamed");
            assert_eq!(remote.description, "now with a description");
        }
        other => panic!("expected FullRecord, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_views_are_all_counted() {
    let pod = build_pod(PodOptions::new("pod-a", recording_transport()));
    let b = pod.befriend("pod-b").await;
    let uuid = Uuid::new_v4();
    pod.store.seed_record(owned_record(uuid, 1, 1));
    pod.store.hold_commits(3);

    let (first, second, third) = tokio::join!(
        pod.orchestrator.view_record(uuid),
        pod.orchestrator.view_record(uuid),
        pod.orchestrator.view_record(uuid),
    );
    let mut views = vec![first.unwrap().views, second.unwrap().views, third.unwrap().views];
    views.sort();
    assert_eq!(views, vec![1, 2, 3]);
    assert_eq!(pod.store.record(uuid).unwrap().views, 3);

    let queued = pod.queued(b.id);
    let sequences: Vec<i64> = queued.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4]);
    let counts: Vec<Option<i64>> = queued
        .into_iter()
        .map(|m| match m.body {
            MessageBody::QuickUpdate(update) => update.views,
            other => panic!("expected QuickUpdate, got {:?}", other),
        })
        .collect();
    assert_eq!(counts, vec![Some(1), Some(2), Some(3)]);
}

#[tokio::test]
async fn test_concurrent_remote_views_reach_the_owner() {
    let loopback = Arc::new(LoopbackTransport::default());
    let a = build_pod(PodOptions::new("pod-a", loopback.clone()));
    let b = build_pod(PodOptions::new("pod-b", loopback.clone()));
    loopback.connect("pod-a", a.inbound.clone());
    loopback.connect("pod-b", b.inbound.clone());
    let b_on_a = a.befriend("pod-b").await.id;
    let a_on_b = b.befriend("pod-a").await.id;
    a.start().await;
    b.start().await;

    let record = a
        .orchestrator
        .create_record(create_request("popular"), upload(".mp4"), owner())
        .await
        .unwrap();
    let uuid = record.uuid;
    eventually(|| b.store.record(uuid).is_some()).await;
    eventually(|| a.store.outbox_for(b_on_a).is_empty()).await;

    // Both views draw an event sequence; the loser of the race retries and takes
    // the next one instead of reusing it.
    b.store.hold_commits(2);
    let (first, second) = tokio::join!(
        b.orchestrator.view_record(uuid),
        b.orchestrator.view_record(uuid),
    );
    first.unwrap();
    second.unwrap();

    eventually(|| a.store.record(uuid).map(|r| r.views) == Some(2)).await;
    eventually(|| b.store.record(uuid).map(|r| r.views) == Some(2)).await;
    assert_eq!(a.store.replica_sequence(b_on_a, uuid), Some(2));
    assert_eq!(b.store.replica_sequence(a_on_b, uuid), Some(3));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_delete_racing_update_leaves_no_record() {
    let pod = build_pod(PodOptions::new("pod-a", recording_transport()));
    let b = pod.befriend("pod-b").await;
    let uuid = Uuid::new_v4();
    pod.store.seed_record(owned_record(uuid, 1, 1));
    pod.store.hold_commits(2);

    let (updated, deleted) = tokio::join!(
        pod.orchestrator.update_record(
            uuid,
            RecordPatch {
                nsfw: Some(true),
                ..Default::default()
            },
        ),
        pod.orchestrator.delete_record(uuid),
    );

    assert!(pod.store.record(uuid).is_none());
    let queued = pod.queued(b.id);
    let remove = queued
        .iter()
        .find(|m| m.body == MessageBody::Remove)
        .expect("removal queued");

    match updated {
        // The update won: the removal comes after it.
        Ok(record) => {
            assert!(deleted.is_ok());
            assert_eq!(record.sequence, 2);
            assert_eq!(remove.sequence, 3);
        }
        // The delete won: the retried update finds nothing.
        Err(err) => {
            assert!(matches!(err, peerpod_core::AppError::NotFound(_)));
            assert_eq!(remove.sequence, 2);
            assert_eq!(queued.len(), 1);
        }
    }
}
