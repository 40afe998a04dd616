//! Initial restore of a database from a snapshot

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::probe::poll_until;
use crate::crd::{Elasticsearch, Snapshot};
use crate::resources::common::{create_if_absent, delete_if_exists, owner_reference, selector_string};
use crate::resources::jobs::{
    JobKind, JobOutcome, generate_restore_job, job_labels, job_outcome, restore_job_name,
    scratch_claim,
};
use crate::storage::{osm_secret, require_location};

/// Outcome of a restore attempt that ran to completion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Namespace and name of the snapshot a database initializes from
pub fn snapshot_source(es: &Elasticsearch) -> Option<(String, String)> {
    let source = es.spec.init.as_ref()?.snapshot_source.as_ref()?;
    let namespace = source
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| es.namespace())?;
    Some((namespace, source.name.clone()))
}

/// Credential secret for the restore job, placed next to the database
fn restore_credentials(es: &Elasticsearch, snapshot: &Snapshot, storage: &Secret) -> Result<Secret> {
    let mut secret = osm_secret(snapshot, storage)?;
    secret.metadata.namespace = es.namespace();
    secret.metadata.owner_references = Some(vec![owner_reference(es)]);
    secret.metadata.labels = Some(job_labels(&es.name_any(), JobKind::Restore));
    Ok(secret)
}

fn scratch_claim_name(es: &Elasticsearch) -> String {
    format!("{}-restore-data", es.name_any())
}

/// Restore `es` from its `init.snapshotSource`
///
/// Emits `Initializing` first, then `SuccessfulInitialize` or
/// `FailedToInitialize`. The job, its pods, claims and credentials are
/// removed whatever the outcome.
#[instrument(skip(ctx, es), fields(name = %es.name_any(), namespace = es.namespace().unwrap_or_default()))]
pub async fn initialize(ctx: &Context, es: &Elasticsearch) -> Result<RestoreOutcome> {
    let (snap_ns, snap_name) = snapshot_source(es)
        .ok_or_else(|| Error::InvalidConfig("spec.init.snapshotSource is not set".to_string()))?;
    ctx.normal(
        es,
        reasons::INITIALIZING,
        actions::RESTORE,
        format!("Initializing from Snapshot: \"{snap_name}\""),
    )
    .await;

    let run = run_restore(ctx, es, &snap_ns, &snap_name).await;
    if let Err(e) = cleanup(ctx, es).await {
        warn!(error = %e, "failed to clean up restore job");
    }

    match run {
        Ok(RestoreOutcome::Succeeded) => {
            ctx.normal(
                es,
                reasons::SUCCESSFUL_INITIALIZE,
                actions::RESTORE,
                "Successfully completed initialization",
            )
            .await;
            Ok(RestoreOutcome::Succeeded)
        }
        Ok(outcome) => {
            ctx.warning(
                es,
                reasons::FAILED_TO_INITIALIZE,
                actions::RESTORE,
                match outcome {
                    RestoreOutcome::TimedOut => "Restore job did not finish in time".to_string(),
                    _ => "Failed to complete initialization".to_string(),
                },
            )
            .await;
            Ok(outcome)
        }
        Err(Error::Cancelled(reason)) => Err(Error::Cancelled(reason)),
        Err(e) => {
            ctx.warning(
                es,
                reasons::FAILED_TO_INITIALIZE,
                actions::RESTORE,
                format!("Failed to initialize. Reason: {e}"),
            )
            .await;
            Err(e)
        }
    }
}

async fn run_restore(
    ctx: &Context,
    es: &Elasticsearch,
    snap_ns: &str,
    snap_name: &str,
) -> Result<RestoreOutcome> {
    let ns = es.namespace().ok_or(Error::MissingObjectKey("namespace"))?;

    let snapshots: Api<Snapshot> = Api::namespaced(ctx.client.clone(), snap_ns);
    let snapshot = snapshots
        .get_opt(snap_name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("snapshot {snap_ns}/{snap_name}")))?;

    let (storage_secret, _) = require_location(&snapshot.spec.storage)?;
    let storage = ctx
        .lookup
        .secret(snap_ns, storage_secret)
        .await?
        .ok_or_else(|| Error::NotFound(format!("storage secret {snap_ns}/{storage_secret}")))?;
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    create_if_absent(&secrets, &restore_credentials(es, &snapshot, &storage)?).await?;

    let scratch = match &snapshot.spec.pod_volume_claim_spec {
        Some(spec) => {
            let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
            let claim = scratch_claim(
                &scratch_claim_name(es),
                Some(ns.clone()),
                job_labels(&es.name_any(), JobKind::Restore),
                spec,
            );
            create_if_absent(&claims, &claim).await?;
            Some(scratch_claim_name(es))
        }
        None => None,
    };

    let record = ctx.lookup.version(&es.spec.version).await?;
    let images = ctx.config.images(&es.spec.version, record.as_ref());
    let job = generate_restore_job(es, &snapshot, &images.tools, scratch);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    match jobs.create(&PostParams::default(), &job).await {
        Ok(_) => info!(job = %job.name_any(), snapshot = snap_name, "created restore job"),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(job = %job.name_any(), "restore job already exists")
        }
        Err(e) => return Err(e.into()),
    }

    let name = restore_job_name(es);
    let finished = poll_until(
        ctx.config.restore_timeout(),
        ctx.config.restore_poll_interval(),
        &ctx.shutdown,
        || async {
            let outcome = jobs.get_opt(&name).await?.map(|j| job_outcome(&j));
            debug!(job = %name, outcome = ?outcome, "polled restore job");
            Ok(match outcome {
                Some(JobOutcome::Succeeded) => Some(RestoreOutcome::Succeeded),
                Some(JobOutcome::Failed) => Some(RestoreOutcome::Failed),
                Some(JobOutcome::Running) => None,
                None => Some(RestoreOutcome::Failed),
            })
        },
    )
    .await?;

    Ok(finished.unwrap_or(RestoreOutcome::TimedOut))
}

/// Remove the restore job with its pods, claims and credentials
pub async fn cleanup(ctx: &Context, es: &Elasticsearch) -> Result<()> {
    let ns = es.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let selector = selector_string(&job_labels(&es.name_any(), JobKind::Restore));
    let params = ListParams::default().labels(&selector);

    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    delete_if_exists(&jobs, &restore_job_name(es)).await?;

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    pods.delete_collection(&DeleteParams::default(), &params).await?;

    let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
    claims.delete_collection(&DeleteParams::default(), &params).await?;

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    secrets.delete_collection(&DeleteParams::default(), &params).await?;

    debug!(selector = %selector, "cleaned up restore job");
    Ok(())
}
