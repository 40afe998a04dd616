pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod storage;
pub mod webhooks;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, Result, dormant_error_policy, error_policy,
    reconcile, reconcile_dormant, reconcile_snapshot, snapshot_error_policy,
};
pub use crd::{DormantDatabase, Elasticsearch, ElasticsearchVersion, Snapshot};
pub use health::{HealthState, Metrics};
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::Controller;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::{Lookup, ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::crd::DatabasePhase;

type ControllerError<E> = kube::runtime::controller::Error<E, kube::runtime::watcher::Error>;

/// How often the per-phase database gauge is refreshed
const FLEET_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn controller_config(ctx: &Context) -> ControllerConfig {
    ControllerConfig::default().concurrency(ctx.config.worker_count)
}

/// Log a controller result; lookups of deleted objects are expected noise
fn log_result<K, E>(kind: &str, result: std::result::Result<(ObjectRef<K>, Action), ControllerError<E>>)
where
    K: Lookup,
    E: std::error::Error + 'static,
{
    match result {
        Ok((obj, _)) => tracing::debug!(kind, name = %obj.name, "reconciled"),
        Err(ControllerError::ObjectNotFound(obj)) => {
            tracing::debug!(kind, name = %obj.name, "object no longer exists")
        }
        Err(e) => tracing::warn!(kind, error = %e, "reconciliation error"),
    }
}

/// Databases in `databases` that point at `secret`
pub fn databases_referencing(
    databases: &[Arc<Elasticsearch>],
    secret: &Secret,
) -> Vec<ObjectRef<Elasticsearch>> {
    let name = secret.name_any();
    databases
        .iter()
        .filter(|es| ResourceExt::namespace(es.as_ref()) == ResourceExt::namespace(secret))
        .filter(|es| es.referenced_secrets().contains(&name.as_str()))
        .map(|es| ObjectRef::from_obj(es.as_ref()))
        .collect()
}

/// Count databases per phase, every phase present
pub fn phase_counts(databases: &[Arc<Elasticsearch>]) -> BTreeMap<String, i64> {
    let mut counts: BTreeMap<String, i64> = [
        DatabasePhase::Empty,
        DatabasePhase::Creating,
        DatabasePhase::Initializing,
        DatabasePhase::Running,
        DatabasePhase::Halted,
        DatabasePhase::Failed,
    ]
    .iter()
    .map(|p| (p.to_string(), 0))
    .collect();
    for es in databases {
        *counts.entry(es.phase().to_string()).or_default() += 1;
    }
    counts
}

async fn report_fleet(store: Store<Elasticsearch>, health: Arc<HealthState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(FLEET_REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        for (phase, count) in phase_counts(&store.state()) {
            health.metrics.set_databases_by_phase(&phase, count);
        }
    }
}

/// Run the Elasticsearch controller until `ctx.shutdown` fires.
///
/// Owned stateful sets, services, secrets and jobs trigger a reconcile of
/// their database, and so does any change to a secret the spec names.
pub async fn run_controller(ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    let client = ctx.client.clone();
    tracing::info!(scope = namespace.unwrap_or("cluster-wide"), "starting Elasticsearch controller");

    let watcher_config = WatcherConfig::default().any_semantic();
    let controller = Controller::new(scoped_api::<Elasticsearch>(client.clone(), namespace), watcher_config.clone())
        .with_config(controller_config(&ctx));
    let store = controller.store();

    if let Some(health) = ctx.health_state.clone() {
        tokio::spawn(report_fleet(store.clone(), health, ctx.shutdown.clone()));
    }

    let shutdown = ctx.shutdown.clone();
    controller
        .owns(scoped_api::<StatefulSet>(client.clone(), namespace), watcher_config.clone())
        .owns(scoped_api::<Service>(client.clone(), namespace), watcher_config.clone())
        .owns(scoped_api::<Secret>(client.clone(), namespace), watcher_config.clone())
        .owns(scoped_api::<Job>(client.clone(), namespace), watcher_config.clone())
        .watches(scoped_api::<Secret>(client, namespace), watcher_config, move |secret| {
            databases_referencing(&store.state(), &secret)
        })
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move { log_result("Elasticsearch", result) })
        .await;

    tracing::info!("Elasticsearch controller stopped");
}

/// Run the DormantDatabase controller until `ctx.shutdown` fires.
pub async fn run_dormant_controller(ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let api = scoped_api::<DormantDatabase>(ctx.client.clone(), namespace.as_deref());
    tracing::info!(scope = namespace.as_deref().unwrap_or("cluster-wide"), "starting DormantDatabase controller");

    let shutdown = ctx.shutdown.clone();
    Controller::new(api, WatcherConfig::default().any_semantic())
        .with_config(controller_config(&ctx))
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile_dormant, dormant_error_policy, ctx)
        .for_each(|result| async move { log_result("DormantDatabase", result) })
        .await;

    tracing::info!("DormantDatabase controller stopped");
}

/// Run the Snapshot controller until `ctx.shutdown` fires.
pub async fn run_snapshot_controller(ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    let client = ctx.client.clone();
    tracing::info!(scope = namespace.unwrap_or("cluster-wide"), "starting Snapshot controller");

    let watcher_config = WatcherConfig::default().any_semantic();
    let shutdown = ctx.shutdown.clone();
    Controller::new(scoped_api::<Snapshot>(client.clone(), namespace), watcher_config.clone())
        .with_config(controller_config(&ctx))
        .owns(scoped_api::<Job>(client, namespace), watcher_config)
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile_snapshot, snapshot_error_policy, ctx)
        .for_each(|result| async move { log_result("Snapshot", result) })
        .await;

    tracing::info!("Snapshot controller stopped");
}
