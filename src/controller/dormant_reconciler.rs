//! Reconciliation of DormantDatabase resources

use std::sync::Arc;

use chrono::Utc;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::dormant::{resumed_database, wipe_out};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::{actions, reasons};
use crate::crd::{DormantDatabase, DormantDatabasePhase, Elasticsearch};
use crate::resources::common::{FIELD_MANAGER, KIND, LABEL_DATABASE_KIND, delete_if_exists};

/// What the controller does next with a dormant record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DormantStep {
    Resume,
    WipeOut,
    /// Data already wiped; only the record is left
    Remove,
    MarkHalted,
    Idle,
}

pub fn next_step(dormant: &DormantDatabase) -> DormantStep {
    let phase = dormant.phase();
    if dormant.spec.resume {
        DormantStep::Resume
    } else if dormant.spec.wipe_out {
        if phase == DormantDatabasePhase::WipedOut {
            DormantStep::Remove
        } else {
            DormantStep::WipeOut
        }
    } else if phase == DormantDatabasePhase::Halted {
        DormantStep::Idle
    } else {
        DormantStep::MarkHalted
    }
}

async fn set_phase(ctx: &Context, dormant: &DormantDatabase, phase: DormantDatabasePhase) -> Result<()> {
    let ns = dormant.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), &ns);
    let mut status = dormant.status.clone().unwrap_or_default();
    let now = Utc::now().to_rfc3339();
    match phase {
        DormantDatabasePhase::Halted => status.halted_at = Some(now),
        DormantDatabasePhase::WipedOut => status.wiped_out_at = Some(now),
        _ => {}
    }
    status.phase = phase;
    status.reason = None;
    api.patch_status(
        &dormant.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;
    Ok(())
}

async fn remove(ctx: &Context, dormant: &DormantDatabase) -> Result<()> {
    let ns = dormant.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), &ns);
    delete_if_exists(&api, &dormant.name_any()).await?;
    Ok(())
}

async fn resume(ctx: &Context, dormant: &DormantDatabase) -> Result<()> {
    if dormant.phase() != DormantDatabasePhase::Resuming {
        set_phase(ctx, dormant, DormantDatabasePhase::Resuming).await?;
    }
    let es = resumed_database(dormant)?;
    let ns = es.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), &ns);
    match api.create(&PostParams::default(), &es).await {
        Ok(_) => {}
        // the previous object may still be finalizing
        Err(kube::Error::Api(e)) if e.code == 409 => {
            return Err(Error::TransientError(format!(
                "Elasticsearch {ns}/{} still exists",
                es.name_any()
            )));
        }
        Err(e) => return Err(e.into()),
    }
    ctx.normal(
        dormant,
        reasons::SUCCESSFUL_CREATE,
        actions::RESUME,
        format!("Resumed Elasticsearch \"{}\"", es.name_any()),
    )
    .await;
    info!(name = %es.name_any(), "resumed database");
    remove(ctx, dormant).await
}

#[instrument(skip(dormant, ctx), fields(name = %dormant.name_any(), namespace = dormant.namespace().unwrap_or_default()))]
pub async fn reconcile_dormant(dormant: Arc<DormantDatabase>, ctx: Arc<Context>) -> Result<Action> {
    if dormant.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    if dormant.labels().get(LABEL_DATABASE_KIND).map(String::as_str) != Some(KIND) {
        return Ok(Action::await_change());
    }

    match next_step(&dormant) {
        DormantStep::Resume => resume(&ctx, &dormant).await?,
        DormantStep::WipeOut => {
            set_phase(&ctx, &dormant, DormantDatabasePhase::WipingOut).await?;
            let origin = &dormant.spec.origin.metadata;
            if let Err(e) = wipe_out(&ctx, &origin.namespace, &origin.name).await {
                ctx.warning(
                    dormant.as_ref(),
                    reasons::FAILED_TO_DELETE,
                    actions::WIPE_OUT,
                    format!("Failed to wipe out. Reason: {e}"),
                )
                .await;
                return Err(e);
            }
            set_phase(&ctx, &dormant, DormantDatabasePhase::WipedOut).await?;
            ctx.normal(
                dormant.as_ref(),
                reasons::SUCCESSFUL,
                actions::WIPE_OUT,
                "Deleted volumes and snapshots",
            )
            .await;
            remove(&ctx, &dormant).await?;
        }
        DormantStep::Remove => remove(&ctx, &dormant).await?,
        DormantStep::MarkHalted => set_phase(&ctx, &dormant, DormantDatabasePhase::Halted).await?,
        DormantStep::Idle => {}
    }
    Ok(Action::await_change())
}

pub fn dormant_error_policy(dormant: Arc<DormantDatabase>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    warn!(dormant = %dormant.name_any(), error = %error, ?delay, "dormant reconcile failed");
    Action::requeue(delay)
}
