//! Halting, terminating and resuming databases through DormantDatabase
//!
//! A halted database leaves behind a DormantDatabase holding its frozen
//! spec. Creating a database with the same name and a matching spec resumes
//! it; volumes survive in between.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::dependents::{delete_volumes, delete_workloads, remove_monitor};
use crate::controller::error::{Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::snapshots::purge;
use crate::crd::{
    CertificateAlias, DormantDatabase, DormantDatabaseSpec, Elasticsearch, ElasticsearchSpec,
    InitSpec, Origin, OriginMeta, OriginSpec, SecretReference, Snapshot, TerminationPolicy,
};
use crate::resources::certificate::{alias_secret_name, cert_secret_name};
use crate::resources::common::{
    ANNOTATION_IGNORE, KIND, LABEL_DATABASE_KIND, create_if_absent,
};
use crate::resources::secret::{auth_secret_name, config_secret_name, is_owned_by};
use crate::webhooks::mutator::spec_diff;

/// Dormant annotation carrying the init spec the frozen spec drops
pub const ANNOTATION_INIT_SPEC: &str = "kubedb.com/elasticsearch-init-spec";

/// Spec as stored in a DormantDatabase: no init, secret names made explicit
pub fn frozen_spec(es: &Elasticsearch) -> ElasticsearchSpec {
    let mut spec = es.spec.clone();
    spec.init = None;
    spec.auth_secret
        .get_or_insert_with(|| SecretReference::new(format!("{}-auth", es.name_any())));
    spec.certificate_secret
        .get_or_insert_with(|| SecretReference::new(format!("{}-cert", es.name_any())));
    spec
}

/// DormantDatabase recording `es` as it was when halted
pub fn dormant_for(es: &Elasticsearch) -> Result<DormantDatabase> {
    let name = es.name_any();
    let namespace = es.namespace().ok_or(Error::MissingObjectKey("namespace"))?;

    let mut annotations = es.annotations().clone();
    annotations.remove(ANNOTATION_IGNORE);

    let mut dormant = DormantDatabase::new(
        &name,
        DormantDatabaseSpec {
            origin: Origin {
                metadata: OriginMeta {
                    name: name.clone(),
                    namespace: namespace.clone(),
                    labels: es.labels().clone(),
                    annotations,
                },
                spec: OriginSpec {
                    elasticsearch: Some(frozen_spec(es)),
                },
            },
            wipe_out: false,
            resume: false,
        },
    );
    dormant.metadata.namespace = Some(namespace);
    dormant.metadata.labels = Some(BTreeMap::from([(
        LABEL_DATABASE_KIND.to_string(),
        KIND.to_string(),
    )]));
    if let Some(init) = &es.spec.init {
        dormant.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_INIT_SPEC.to_string(),
            serde_json::to_string(init)?,
        )]));
    }
    Ok(dormant)
}

/// Error unless `dormant` may be resumed as `es`
///
/// Monitor, backup schedule and doNotPause may differ; everything else in
/// the frozen spec must match.
pub fn check_dormant_match(es: &Elasticsearch, dormant: &DormantDatabase) -> Result<()> {
    let kind = dormant.labels().get(LABEL_DATABASE_KIND).map(String::as_str);
    if kind != Some(KIND) {
        return Err(Error::ValidationError(format!(
            "invalid Elasticsearch: \"{}\". Exists DormantDatabase \"{}\" of different Kind",
            es.name_any(),
            dormant.name_any()
        )));
    }
    let mut origin = dormant.origin_elasticsearch().cloned().ok_or_else(|| {
        Error::InvalidConfig(format!(
            "DormantDatabase {} has no origin spec",
            dormant.name_any()
        ))
    })?;

    let desired = frozen_spec(es);
    if desired.monitor.is_some() {
        origin.monitor = desired.monitor.clone();
    }
    if desired.backup_schedule.is_some() {
        origin.backup_schedule = desired.backup_schedule.clone();
    }
    origin.do_not_pause = desired.do_not_pause;

    if origin != desired {
        return Err(Error::SpecMismatch(spec_diff(&origin, &desired)?));
    }
    Ok(())
}

/// Hand a new database over to a matching dormant record
///
/// Returns `true` when a resume was started; the caller stops reconciling
/// this object, which is deleted and later recreated from the record.
#[instrument(skip(ctx, es), fields(name = %es.name_any()))]
pub async fn match_dormant(ctx: &Context, es: &Elasticsearch) -> Result<bool> {
    let ns = es.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let dormant = match ctx.lookup.dormant(&ns, &es.name_any()).await {
        Ok(Some(dormant)) => dormant,
        Ok(None) => return Ok(false),
        Err(e) => {
            ctx.warning(
                es,
                reasons::FAILED_TO_GET,
                actions::RESUME,
                format!("Fail to get DormantDatabase: \"{}\". Reason: {e}", es.name_any()),
            )
            .await;
            return Err(e);
        }
    };
    if dormant.spec.resume {
        // already resuming; this object is the recreated one
        return Ok(false);
    }

    if let Err(e) = check_dormant_match(es, &dormant) {
        ctx.warning(es, reasons::FAILED_TO_CREATE, actions::RESUME, e.to_string())
            .await;
        return Err(e);
    }

    let databases: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), &ns);
    let ignore = json!({ "metadata": { "annotations": { ANNOTATION_IGNORE: "set" } } });
    databases
        .patch(&es.name_any(), &PatchParams::default(), &Patch::Merge(&ignore))
        .await?;
    databases
        .delete(&es.name_any(), &Default::default())
        .await
        .map_err(|e| {
            Error::TransientError(format!(
                "failed to resume Elasticsearch \"{}\" from DormantDatabase: {e}",
                es.name_any()
            ))
        })?;

    let dormants: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), &ns);
    dormants
        .patch(
            &dormant.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&json!({ "spec": { "resume": true } })),
        )
        .await?;
    info!("resuming from DormantDatabase");
    Ok(true)
}

/// Drop owner references so generated secrets outlive the database
async fn release_secrets(ctx: &Context, es: &Elasticsearch) -> Result<()> {
    let ns = es.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let mut names = vec![
        auth_secret_name(es),
        cert_secret_name(es),
        config_secret_name(es),
    ];
    names.extend(
        [
            CertificateAlias::Transport,
            CertificateAlias::Http,
            CertificateAlias::Admin,
        ]
        .map(|alias| alias_secret_name(es, alias)),
    );

    let release = json!({ "metadata": { "ownerReferences": null } });
    for name in names {
        let Some(secret) = api.get_opt(&name).await? else {
            continue;
        };
        if !is_owned_by(&secret, es) {
            continue;
        }
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&release))
            .await?;
        debug!(secret = %name, "released secret");
    }
    Ok(())
}

/// Delete every snapshot of a database, object-store data included
pub async fn delete_snapshots(ctx: &Context, namespace: &str, name: &str) -> Result<usize> {
    let api: Api<Snapshot> = Api::namespaced(ctx.client.clone(), namespace);
    let snapshots = api.list(&ListParams::default()).await?;
    let mut deleted = 0;
    for snapshot in snapshots
        .items
        .iter()
        .filter(|s| s.spec.database_name == name)
    {
        purge(ctx, snapshot).await?;
        deleted += 1;
    }
    debug!(namespace, name, deleted, "deleted snapshots");
    Ok(deleted)
}

/// Volumes and snapshots of a database
pub async fn wipe_out(ctx: &Context, namespace: &str, name: &str) -> Result<()> {
    delete_snapshots(ctx, namespace, name).await?;
    delete_volumes(ctx, namespace, name).await?;
    Ok(())
}

/// Stop everything that runs on behalf of a database
async fn quiesce(ctx: &Context, es: &Elasticsearch) -> Result<()> {
    let ns = es.namespace().unwrap_or_default();
    ctx.cron.stop(&es.name_any(), &ns);
    if let Err(e) = remove_monitor(ctx, es).await {
        warn!(error = %e, "failed to remove monitor");
        ctx.warning(
            es,
            reasons::FAILED_TO_DELETE_MONITOR,
            actions::MONITOR,
            format!("Failed to delete monitoring system. Reason: {e}"),
        )
        .await;
    }
    Ok(())
}

/// Cleanup for a database being deleted, according to its termination policy
#[instrument(skip(ctx, es), fields(name = %es.name_any(), policy = ?es.spec.termination_policy))]
pub async fn terminate(ctx: &Context, es: &Elasticsearch) -> Result<()> {
    let ns = es.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let name = es.name_any();

    match es.spec.termination_policy {
        TerminationPolicy::DoNotTerminate => {
            return Err(Error::ValidationError(format!(
                "elasticsearch \"{name}\" can't be deleted. To delete, change spec.terminationPolicy"
            )));
        }
        TerminationPolicy::Halt => {
            quiesce(ctx, es).await?;
            release_secrets(ctx, es).await?;
            let dormants: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), &ns);
            create_if_absent(&dormants, &dormant_for(es)?).await?;
            ctx.normal(
                es,
                reasons::PAUSING,
                actions::HALT,
                format!("Elasticsearch \"{name}\" halted; DormantDatabase created"),
            )
            .await;
        }
        TerminationPolicy::WipeOut => {
            quiesce(ctx, es).await?;
            delete_workloads(ctx, es).await?;
            wipe_out(ctx, &ns, &name).await?;
            ctx.normal(
                es,
                reasons::SUCCESSFUL,
                actions::WIPE_OUT,
                "Deleted volumes and snapshots",
            )
            .await;
        }
        TerminationPolicy::Delete => {
            quiesce(ctx, es).await?;
            delete_workloads(ctx, es).await?;
            delete_volumes(ctx, &ns, &name).await?;
        }
    }
    info!("terminated");
    Ok(())
}

/// Take a running database offline while keeping its volumes and secrets
#[instrument(skip(ctx, es), fields(name = %es.name_any()))]
pub async fn halt(ctx: &Context, es: &Elasticsearch) -> Result<()> {
    quiesce(ctx, es).await?;
    delete_workloads(ctx, es).await?;
    info!("halted");
    Ok(())
}

/// Database to recreate from a dormant record
///
/// A recorded init spec comes back marked initialized so the restore does
/// not run twice.
pub fn resumed_database(dormant: &DormantDatabase) -> Result<Elasticsearch> {
    let origin = &dormant.spec.origin;
    let mut spec = dormant.origin_elasticsearch().cloned().ok_or_else(|| {
        Error::InvalidConfig(format!(
            "DormantDatabase {} has no origin spec",
            dormant.name_any()
        ))
    })?;
    if let Some(raw) = dormant.annotations().get(ANNOTATION_INIT_SPEC) {
        let mut init: InitSpec = serde_json::from_str(raw)?;
        init.initialized = true;
        spec.init = Some(init);
    }

    let mut annotations = origin.metadata.annotations.clone();
    annotations.remove(ANNOTATION_IGNORE);

    let mut es = Elasticsearch::new(&origin.metadata.name, spec);
    es.metadata.namespace = Some(origin.metadata.namespace.clone());
    es.metadata.labels = (!origin.metadata.labels.is_empty()).then(|| origin.metadata.labels.clone());
    es.metadata.annotations = (!annotations.is_empty()).then_some(annotations);
    Ok(es)
}
