//! Kubernetes Events for the Elasticsearch controllers
//!
//! Events are fire-and-forget: publish failures are logged and never fail a
//! reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tokio::sync::Mutex;
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub object: Option<String>,
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// Keeps every event in memory; used by tests to assert on what was emitted
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().await.clone()
    }

    pub async fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().await.push(RecordedEvent {
            object: resource_ref.name.clone(),
            warning: type_ == EventType::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// Event reasons shown under REASON in `kubectl get events`
pub mod reasons {
    pub const INVALID: &str = "Invalid";
    pub const FAILED_TO_LIST: &str = "FailedToList";
    pub const FAILED_TO_GET: &str = "FailedToGet";
    pub const FAILED_TO_CREATE: &str = "FailedToCreate";
    pub const FAILED_TO_UPDATE: &str = "FailedToUpdate";
    pub const FAILED_TO_DELETE: &str = "FailedToDelete";
    pub const FAILED_TO_START: &str = "FailedToStart";
    pub const FAILED_TO_SCHEDULE: &str = "FailedToSchedule";
    pub const FAILED_TO_INITIALIZE: &str = "FailedToInitialize";
    pub const IGNORED_SNAPSHOT: &str = "IgnoredSnapshot";
    pub const INITIALIZING: &str = "Initializing";
    pub const PAUSING: &str = "Pausing";
    pub const SUCCESSFUL: &str = "Successful";
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    pub const SUCCESSFUL_INITIALIZE: &str = "SuccessfulInitialize";
    pub const SUCCESSFUL_MONITOR_ADD: &str = "SuccessfulMonitorAdd";
    pub const SUCCESSFUL_MONITOR_DELETE: &str = "SuccessfulMonitorDelete";
    pub const FAILED_TO_ADD_MONITOR: &str = "FailedToAddMonitor";
    pub const FAILED_TO_DELETE_MONITOR: &str = "FailedToDeleteMonitor";
}

/// Event actions shown under ACTION
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const CREATE: &str = "Create";
    pub const HALT: &str = "Halt";
    pub const TERMINATE: &str = "Terminate";
    pub const RESTORE: &str = "Restore";
    pub const BACKUP: &str = "Backup";
    pub const MONITOR: &str = "Monitor";
    pub const WIPE_OUT: &str = "WipeOut";
    pub const RESUME: &str = "Resume";
}
