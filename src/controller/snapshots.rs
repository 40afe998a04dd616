//! Reconciliation of Snapshot resources
//!
//! A new snapshot gets a backup Job; a running one is followed until the
//! Job finishes. The phase is mirrored into a label so the cron engine can
//! select running snapshots without reading status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::cron::{KubeSnapshotClient, SnapshotClient};
use crate::controller::error::{Error, Result};
use crate::controller::events::{actions, reasons};
use crate::crd::{DatabasePhase, Snapshot, SnapshotPhase, SnapshotStatus};
use crate::resources::common::{FIELD_MANAGER, LABEL_SNAPSHOT_STATUS, create_if_absent};
use crate::resources::jobs::{
    JobKind, JobOutcome, backup_job_name, generate_backup_job, job_labels, job_outcome,
    scratch_claim, snapshot_owner_reference,
};
use crate::storage::{container_from_secret, delete_snapshot_data, osm_secret, require_location};

const POLL_INTERVAL: Duration = Duration::from_secs(30);

fn namespace(snapshot: &Snapshot) -> Result<String> {
    snapshot
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))
}

/// Status after the backup job reported `outcome`; `None` while it runs
pub fn finished_status(current: &SnapshotStatus, outcome: JobOutcome) -> Option<SnapshotStatus> {
    let (phase, reason) = match outcome {
        JobOutcome::Running => return None,
        JobOutcome::Succeeded => (SnapshotPhase::Succeeded, None),
        JobOutcome::Failed => (
            SnapshotPhase::Failed,
            Some("backup job failed".to_string()),
        ),
    };
    Some(SnapshotStatus {
        phase,
        reason,
        start_time: current.start_time.clone(),
        completion_time: Some(Utc::now().to_rfc3339()),
    })
}

async fn write_status(ctx: &Context, snapshot: &Snapshot, status: &SnapshotStatus) -> Result<()> {
    let ns = namespace(snapshot)?;
    let api: Api<Snapshot> = Api::namespaced(ctx.client.clone(), &ns);
    let name = snapshot.name_any();
    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;
    let labels = json!({ "metadata": { "labels": { LABEL_SNAPSHOT_STATUS: status.phase.to_string() } } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&labels))
        .await?;
    debug!(snapshot = %name, phase = %status.phase, "updated snapshot status");
    Ok(())
}

async fn fail(ctx: &Context, snapshot: &Snapshot, reason: String) -> Result<Action> {
    warn!(snapshot = %snapshot.name_any(), %reason, "snapshot failed");
    ctx.warning(snapshot, reasons::FAILED_TO_CREATE, actions::BACKUP, reason.clone())
        .await;
    let status = SnapshotStatus {
        phase: SnapshotPhase::Failed,
        reason: Some(reason),
        start_time: None,
        completion_time: Some(Utc::now().to_rfc3339()),
    };
    write_status(ctx, snapshot, &status).await?;
    Ok(Action::await_change())
}

/// Another snapshot of the same database whose job is still running
async fn running_sibling(
    client: &dyn SnapshotClient,
    namespace: &str,
    snapshot: &Snapshot,
) -> Result<Option<String>> {
    let own = snapshot.name_any();
    Ok(client
        .running_snapshots(namespace, &snapshot.spec.database_name)
        .await?
        .into_iter()
        .find(|name| *name != own))
}

/// Launch the backup job of a new snapshot
async fn start(ctx: &Context, snapshot: &Snapshot) -> Result<Action> {
    let ns = namespace(snapshot)?;
    let (storage_secret, _) = match require_location(&snapshot.spec.storage) {
        Ok(location) => location,
        Err(e) => return fail(ctx, snapshot, e.to_string()).await,
    };

    let database = &snapshot.spec.database_name;
    let Some(es) = ctx.lookup.elasticsearch(&ns, database).await? else {
        return fail(ctx, snapshot, format!("Elasticsearch {ns}/{database} not found")).await;
    };
    if es.phase() != DatabasePhase::Running {
        debug!(database = %database, phase = %es.phase(), "database not running yet");
        return Ok(Action::requeue(POLL_INTERVAL));
    }
    let siblings = KubeSnapshotClient::new(ctx.client.clone());
    if let Some(running) = running_sibling(&siblings, &ns, snapshot).await? {
        debug!(database = %database, %running, "waiting for running snapshot");
        return Ok(Action::requeue(POLL_INTERVAL));
    }
    let Some(storage) = ctx.lookup.secret(&ns, storage_secret).await? else {
        return fail(ctx, snapshot, format!("storage secret {ns}/{storage_secret} not found")).await;
    };

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    create_if_absent(&secrets, &osm_secret(snapshot, &storage)?).await?;

    let scratch = match &snapshot.spec.pod_volume_claim_spec {
        Some(spec) => {
            let name = format!("{}-backup-data", snapshot.name_any());
            let mut claim = scratch_claim(
                &name,
                Some(ns.clone()),
                job_labels(database, JobKind::Backup),
                spec,
            );
            claim.metadata.owner_references = Some(vec![snapshot_owner_reference(snapshot)]);
            let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
            create_if_absent(&claims, &claim).await?;
            Some(name)
        }
        None => None,
    };

    let record = ctx.lookup.version(&es.spec.version).await?;
    let images = ctx.config.images(&es.spec.version, record.as_ref());
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    create_if_absent(&jobs, &generate_backup_job(&es, snapshot, &images.tools, scratch)).await?;

    let status = SnapshotStatus {
        phase: SnapshotPhase::Running,
        reason: None,
        start_time: Some(Utc::now().to_rfc3339()),
        completion_time: None,
    };
    write_status(ctx, snapshot, &status).await?;
    ctx.normal(
        snapshot,
        reasons::SUCCESSFUL_CREATE,
        actions::BACKUP,
        format!("Backup job {} started", backup_job_name(snapshot)),
    )
    .await;
    info!(snapshot = %snapshot.name_any(), database = %database, "started backup");
    Ok(Action::requeue(POLL_INTERVAL))
}

/// Follow the backup job of a running snapshot
async fn follow(ctx: &Context, snapshot: &Snapshot) -> Result<Action> {
    let ns = namespace(snapshot)?;
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    let outcome = match jobs.get_opt(&backup_job_name(snapshot)).await? {
        Some(job) => job_outcome(&job),
        None => JobOutcome::Failed,
    };
    let current = snapshot.status.clone().unwrap_or_default();
    let Some(status) = finished_status(&current, outcome) else {
        return Ok(Action::requeue(POLL_INTERVAL));
    };

    write_status(ctx, snapshot, &status).await?;
    match status.phase {
        SnapshotPhase::Succeeded => {
            ctx.normal(
                snapshot,
                reasons::SUCCESSFUL,
                actions::BACKUP,
                "Successfully completed backup",
            )
            .await
        }
        _ => {
            ctx.warning(
                snapshot,
                reasons::FAILED_TO_CREATE,
                actions::BACKUP,
                "Backup job failed",
            )
            .await
        }
    }
    info!(snapshot = %snapshot.name_any(), phase = %status.phase, "backup finished");
    Ok(Action::await_change())
}

#[instrument(skip(snapshot, ctx), fields(name = %snapshot.name_any(), namespace = snapshot.namespace().unwrap_or_default()))]
pub async fn reconcile_snapshot(snapshot: Arc<Snapshot>, ctx: Arc<Context>) -> Result<Action> {
    if snapshot.metadata.deletion_timestamp.is_some() {
        // owned job, claim and credentials go with it
        return Ok(Action::await_change());
    }
    match snapshot.phase() {
        SnapshotPhase::Pending => start(&ctx, &snapshot).await,
        SnapshotPhase::Running => follow(&ctx, &snapshot).await,
        SnapshotPhase::Succeeded | SnapshotPhase::Failed => Ok(Action::await_change()),
    }
}

pub fn snapshot_error_policy(snapshot: Arc<Snapshot>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = crate::controller::error::BackoffConfig::default().delay_for_error(error, 0);
    warn!(snapshot = %snapshot.name_any(), error = %error, ?delay, "snapshot reconcile failed");
    Action::requeue(delay)
}

/// Delete a snapshot's object-store data, then the Snapshot itself
pub async fn purge(ctx: &Context, snapshot: &Snapshot) -> Result<()> {
    let ns = namespace(snapshot)?;
    if let Ok((secret_name, bucket)) = require_location(&snapshot.spec.storage) {
        match ctx.lookup.secret(&ns, secret_name).await? {
            Some(secret) => {
                let container = container_from_secret(&secret, bucket)?;
                delete_snapshot_data(container.as_ref(), snapshot).await?;
            }
            None => warn!(
                snapshot = %snapshot.name_any(),
                secret = secret_name,
                "storage secret missing; leaving snapshot data in place"
            ),
        }
    }
    let api: Api<Snapshot> = Api::namespaced(ctx.client.clone(), &ns);
    crate::resources::common::delete_if_exists(&api, &snapshot.name_any()).await?;
    Ok(())
}
