//! Unit tests for snapshot storage

use crate::common::*;
use bytes::Bytes;
use elasticsearch_operator::crd::SnapshotStorageSpec;
use elasticsearch_operator::storage::{
    Container, ObjectStoreContainer, delete_snapshot_data, require_location, snapshot_location,
};

async fn seed(container: &ObjectStoreContainer, location: &str, parts: usize) {
    for i in 0..parts {
        container
            .put(&format!("{location}/part-{i}"), Bytes::from(vec![i as u8]))
            .await
            .unwrap();
    }
}

#[test]
fn test_location_is_scoped_by_namespace_and_database() {
    let snapshot = create_test_snapshot("nightly", "demo", "quick-es");
    assert_eq!(snapshot_location(&snapshot), "kubedb/demo/quick-es/nightly");

    let mut prefixed = snapshot.clone();
    prefixed.spec.storage.prefix = Some("archive".to_string());
    assert_eq!(
        snapshot_location(&prefixed),
        "archive/kubedb/demo/quick-es/nightly"
    );
}

#[test]
fn test_require_location() {
    let complete = storage_location("gcs-secret", "backups");
    assert_eq!(require_location(&complete).unwrap(), ("gcs-secret", "backups"));

    let missing_bucket = SnapshotStorageSpec {
        bucket_name: Some(String::new()),
        ..complete.clone()
    };
    assert!(require_location(&missing_bucket).is_err());
    assert!(require_location(&SnapshotStorageSpec::default()).is_err());
}

#[tokio::test]
async fn test_wiping_one_database_spares_its_neighbour() {
    let container = ObjectStoreContainer::in_memory();
    let mine = [
        create_test_snapshot("quick-es-1", "demo", "quick-es"),
        create_test_snapshot("quick-es-2", "demo", "quick-es"),
    ];
    let neighbour = create_test_snapshot("quick-es-1", "other", "quick-es");
    for snapshot in mine.iter().chain([&neighbour]) {
        seed(&container, &snapshot_location(snapshot), 3).await;
    }

    let mut deleted = 0;
    for snapshot in &mine {
        deleted += delete_snapshot_data(&container, snapshot).await.unwrap();
    }
    assert_eq!(deleted, 6);

    let remaining = container.list("kubedb").await.unwrap();
    assert_eq!(remaining.len(), 3);
    assert!(remaining.iter().all(|k| k.starts_with("kubedb/other/")));
}

#[tokio::test]
async fn test_deleting_missing_data_is_not_an_error() {
    let container = ObjectStoreContainer::in_memory();
    let snapshot = create_test_snapshot("never-ran", "demo", "quick-es");
    assert_eq!(delete_snapshot_data(&container, &snapshot).await.unwrap(), 0);
}
