//! Unit tests for scheduled snapshots
//!
//! The engine runs against an in-memory snapshot client with tokio's clock
//! paused, so hour-long schedules fire instantly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use elasticsearch_operator::controller::cron::{
    CronEngine, FireTarget, SnapshotClient, entry_key, fire,
};
use elasticsearch_operator::controller::events::RecordingEventPublisher;
use elasticsearch_operator::controller::{Error, Result};
use elasticsearch_operator::crd::{BackupScheduleSpec, Snapshot};
use elasticsearch_operator::health::FireOutcome;
use k8s_openapi::api::core::v1::ObjectReference;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::common::*;

#[derive(Default)]
struct InMemorySnapshots {
    running: Mutex<Vec<String>>,
    created: Mutex<Vec<Snapshot>>,
    fail_create: bool,
}

#[async_trait]
impl SnapshotClient for InMemorySnapshots {
    async fn running_snapshots(&self, _namespace: &str, _database: &str) -> Result<Vec<String>> {
        Ok(self.running.lock().await.clone())
    }

    async fn create_snapshot(&self, _namespace: &str, snapshot: &Snapshot) -> Result<()> {
        if self.fail_create {
            return Err(Error::StorageError("quota exceeded".to_string()));
        }
        self.created.lock().await.push(snapshot.clone());
        Ok(())
    }
}

fn target() -> FireTarget {
    FireTarget {
        name: "quick-es".to_string(),
        namespace: "demo".to_string(),
        storage: storage_location("gcs-secret", "backups"),
        object_ref: ObjectReference {
            name: Some("quick-es".to_string()),
            namespace: Some("demo".to_string()),
            ..Default::default()
        },
    }
}

fn hourly() -> BackupScheduleSpec {
    BackupScheduleSpec {
        cron_expression: "@every 1h".to_string(),
        storage: storage_location("gcs-secret", "backups"),
    }
}

fn engine(client: Arc<InMemorySnapshots>) -> CronEngine {
    CronEngine::new(
        client,
        Arc::new(RecordingEventPublisher::default()),
        None,
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn test_fire_failure_emits_warning() {
    let client = InMemorySnapshots {
        fail_create: true,
        ..Default::default()
    };
    let events = RecordingEventPublisher::default();
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    assert_eq!(fire(&client, &events, &target(), at).await, FireOutcome::Failed);
    let recorded = events.events().await;
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].warning);
    assert_eq!(recorded[0].reason, "FailedToCreate");
    assert_eq!(recorded[0].object.as_deref(), Some("quick-es"));
}

#[tokio::test]
async fn test_fire_without_running_snapshot_emits_nothing() {
    let client = InMemorySnapshots::default();
    let events = RecordingEventPublisher::default();

    assert_eq!(
        fire(&client, &events, &target(), Utc::now()).await,
        FireOutcome::Created
    );
    assert!(events.events().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_entry_fires_on_schedule_until_stopped() {
    let client = Arc::new(InMemorySnapshots::default());
    let engine = engine(client.clone());

    engine
        .schedule("quick-es", "demo", ObjectReference::default(), &hourly())
        .unwrap();
    assert!(engine.contains("quick-es", "demo"));
    assert!(client.created.lock().await.is_empty());

    tokio::time::sleep(Duration::from_secs(3600 + 1)).await;
    {
        let created = client.created.lock().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].spec.database_name, "quick-es");
        assert_eq!(created[0].spec.storage.bucket_name.as_deref(), Some("backups"));
    }

    engine.stop("quick-es", "demo");
    tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
    assert_eq!(client.created.lock().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_running_snapshot_suppresses_fire() {
    let client = Arc::new(InMemorySnapshots::default());
    client.running.lock().await.push("quick-es-previous".to_string());
    let engine = engine(client.clone());

    engine
        .schedule("quick-es", "demo", ObjectReference::default(), &hourly())
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2 * 3600 + 1)).await;
    assert!(client.created.lock().await.is_empty());
    engine.shutdown();
    assert!(engine.is_empty());
}

#[tokio::test]
async fn test_entries_are_keyed_per_namespace() {
    let engine = engine(Arc::new(InMemorySnapshots::default()));
    engine
        .schedule("quick-es", "demo", ObjectReference::default(), &hourly())
        .unwrap();
    engine
        .schedule("quick-es", "staging", ObjectReference::default(), &hourly())
        .unwrap();
    // unchanged schedule keeps the existing entry
    engine
        .schedule("quick-es", "demo", ObjectReference::default(), &hourly())
        .unwrap();

    assert_eq!(engine.len(), 2);
    assert_eq!(entry_key("quick-es", "staging"), "quick-es@staging");
    engine.stop("quick-es", "demo");
    assert!(!engine.contains("quick-es", "demo"));
    assert!(engine.contains("quick-es", "staging"));
    engine.shutdown();
}
