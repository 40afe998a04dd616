use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::{Client, Resource};
use tokio_util::sync::CancellationToken;

use crate::config::OperatorConfig;
use crate::controller::cron::{CronEngine, KubeSnapshotClient};
use crate::controller::events::{EventPublisher, KubeEventPublisher};
use crate::controller::probe::{KubeWorkloadProbe, WorkloadProbe};
use crate::controller::validation::{ClusterLookup, KubeLookup};
use crate::health::HealthState;

/// Name the operator reports events under
pub const CONTROLLER_NAME: &str = "elasticsearch-operator";

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub config: OperatorConfig,
    pub events: Arc<dyn EventPublisher>,
    pub cron: Arc<CronEngine>,
    pub probe: Arc<dyn WorkloadProbe>,
    pub lookup: Arc<dyn ClusterLookup>,
    pub health_state: Option<Arc<HealthState>>,
    /// Cancelled on process shutdown; long waits observe it
    pub shutdown: CancellationToken,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
        shutdown: CancellationToken,
    ) -> Self {
        let events: Arc<dyn EventPublisher> =
            Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        let cron = Arc::new(CronEngine::new(
            Arc::new(KubeSnapshotClient::new(client.clone())),
            events.clone(),
            health_state.clone(),
            shutdown.child_token(),
        ));
        Self {
            probe: Arc::new(KubeWorkloadProbe::new(client.clone())),
            lookup: Arc::new(KubeLookup::new(client.clone())),
            client,
            config,
            events,
            cron,
            health_state,
            shutdown,
        }
    }

    pub async fn publish<K>(
        &self,
        obj: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let reference: ObjectReference = obj.object_ref(&());
        self.events
            .publish(&reference, type_, reason, action, note)
            .await;
    }

    pub async fn normal<K>(&self, obj: &K, reason: &str, action: &str, note: impl Into<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(obj, EventType::Normal, reason, action, Some(note.into()))
            .await;
    }

    pub async fn warning<K>(&self, obj: &K, reason: &str, action: &str, note: impl Into<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(obj, EventType::Warning, reason, action, Some(note.into()))
            .await;
    }
}
