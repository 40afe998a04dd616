//! Reconciliation logic for Elasticsearch resources
//!
//! One pass of [`reconcile`] takes a database through deletion, halting or
//! creation. Creation doubles as the steady-state reconcile: every
//! dependent is create-or-patched, so running it again is cheap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::dependents::{self, EnsureOutcome};
use crate::controller::dormant;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::restore::{self, RestoreOutcome};
use crate::controller::state_machine::DatabaseEvent;
use crate::controller::status::{StatusManager, spec_changed};
use crate::controller::validation;
use crate::crd::{DatabasePhase, Elasticsearch};
use crate::resources::common::{ANNOTATION_IGNORE, ANNOTATION_INITIALIZED, KIND, Verb};

/// Finalizer guarding the termination policy
pub const FINALIZER: &str = "kubedb.com";

/// Periodic resync of a healthy database
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

#[instrument(skip(es, ctx), fields(name = %es.name_any(), namespace = es.namespace().unwrap_or_default()))]
pub async fn reconcile(es: Arc<Elasticsearch>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let ns = es.namespace().unwrap_or_default();
    let name = es.name_any();

    let result = reconcile_inner(&es, &ctx).await;

    if let Some(state) = &ctx.health_state {
        state
            .metrics
            .record_reconcile(KIND, &ns, &name, started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => state.touch(),
            Err(_) => state.metrics.record_error(KIND, &ns, &name),
        }
    }
    result
}

async fn reconcile_inner(es: &Elasticsearch, ctx: &Context) -> Result<Action> {
    if es.metadata.deletion_timestamp.is_some() {
        return handle_deletion(es, ctx).await;
    }

    if !has_finalizer(es) {
        add_finalizer(es, ctx).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if es.spec.paused {
        debug!("paused; skipping");
        return Ok(Action::await_change());
    }

    let mut status = StatusManager::new(es, ctx);

    if es.spec.halted {
        return halt(es, ctx, &mut status).await;
    }
    if *status.phase() == DatabasePhase::Halted {
        status.transition(DatabaseEvent::Resumed, None).await?;
    }
    if *status.phase() == DatabasePhase::Failed {
        if !spec_changed(es) {
            debug!("failed database waits for a spec change");
            return Ok(Action::await_change());
        }
        status.transition(DatabaseEvent::RetryRequested, None).await?;
    }

    match create(es, ctx, &mut status).await {
        Ok(action) => Ok(action),
        Err(e) if e.is_user_error() => {
            warn!(error = %e, "reconcile stopped on invalid input");
            ctx.warning(es, reasons::FAILED_TO_CREATE, actions::CREATE, e.to_string())
                .await;
            if let Err(status_err) = status.set_reason(&e.to_string()).await {
                warn!(error = %status_err, "failed to record reason");
            }
            Ok(Action::await_change())
        }
        Err(Error::Cancelled(reason)) => {
            debug!(%reason, "reconcile cancelled");
            Err(Error::Cancelled(reason))
        }
        Err(e) => {
            error!(error = %e, "reconcile failed");
            ctx.warning(
                es,
                reasons::FAILED_TO_CREATE,
                actions::CREATE,
                format!("Failed to reconcile Elasticsearch. Reason: {e}"),
            )
            .await;
            Err(e)
        }
    }
}

/// Create or update everything the database needs
async fn create(es: &Elasticsearch, ctx: &Context, status: &mut StatusManager<'_>) -> Result<Action> {
    if let Err(e) = validation::validate(ctx, es).await {
        if e.is_user_error() {
            ctx.warning(es, reasons::INVALID, actions::CREATE, e.to_string())
                .await;
            status.set_reason(&e.to_string()).await?;
            return Ok(Action::await_change());
        }
        return Err(e);
    }

    let creating = es
        .status
        .as_ref()
        .is_none_or(|s| s.creation_time.is_none());
    if creating {
        status.transition(DatabaseEvent::CreationStarted, None).await?;
    }

    if dormant::match_dormant(ctx, es).await? {
        info!("handed over to DormantDatabase");
        return Ok(Action::await_change());
    }

    let outcome = dependents::ensure(ctx, es).await?;
    report_outcome(es, ctx, &outcome).await;

    let changed = outcome.overall() != Verb::Unchanged;
    if changed || *status.phase() != DatabasePhase::Running {
        debug!(verb = %outcome.overall(), "waiting for cluster formation");
        dependents::wait_for_formation(ctx).await?;
    }
    status.transition(DatabaseEvent::ClusterFormed, None).await?;

    if needs_restore(es, &outcome, status.phase()) {
        if let Some(action) = restore(es, ctx, status).await? {
            return Ok(action);
        }
    }

    schedule_backups(es, ctx).await;
    dependents::ensure_monitor(ctx, es).await;

    status.observe().await?;
    info!(phase = %status.phase(), "reconciled");
    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn report_outcome(es: &Elasticsearch, ctx: &Context, outcome: &EnsureOutcome) {
    let note = match outcome.overall() {
        Verb::Created => "Successfully created Elasticsearch",
        Verb::Patched => "Successfully patched Elasticsearch",
        Verb::Unchanged => return,
    };
    ctx.normal(es, reasons::SUCCESSFUL, actions::CREATE, note)
        .await;
}

/// Restore runs once, right after the node workloads were first created.
/// A database still `Initializing` lost its restore to a restart and runs it
/// again; the restore job is reused when it survived.
fn needs_restore(es: &Elasticsearch, outcome: &EnsureOutcome, phase: &DatabasePhase) -> bool {
    if restore::snapshot_source(es).is_none() {
        return false;
    }
    let initialized = es.spec.init.as_ref().is_some_and(|i| i.initialized)
        || es.annotations().contains_key(ANNOTATION_INITIALIZED);
    if initialized {
        return false;
    }
    outcome.workloads == Verb::Created || *phase == DatabasePhase::Initializing
}

/// Event that must precede `HaltRequested` for the halt to be accepted
fn halt_prelude(phase: &DatabasePhase) -> Option<DatabaseEvent> {
    match phase {
        DatabasePhase::Empty => Some(DatabaseEvent::CreationStarted),
        _ => None,
    }
}

/// Run the initial restore; `Some` ends the reconcile with that action
async fn restore(
    es: &Elasticsearch,
    ctx: &Context,
    status: &mut StatusManager<'_>,
) -> Result<Option<Action>> {
    status.transition(DatabaseEvent::RestoreStarted, None).await?;

    let reason = match restore::initialize(ctx, es).await {
        Ok(RestoreOutcome::Succeeded) => {
            mark_initialized(es, ctx).await?;
            status
                .transition(DatabaseEvent::RestoreSucceeded, None)
                .await?;
            return Ok(None);
        }
        Ok(RestoreOutcome::TimedOut) => "restore job did not finish in time".to_string(),
        Ok(RestoreOutcome::Failed) => "restore job failed".to_string(),
        Err(Error::Cancelled(reason)) => return Err(Error::Cancelled(reason)),
        Err(e) => e.to_string(),
    };

    warn!(%reason, "initialization failed");
    status
        .transition(DatabaseEvent::RestoreFailed, Some(reason))
        .await?;
    Ok(Some(Action::await_change()))
}

async fn mark_initialized(es: &Elasticsearch, ctx: &Context) -> Result<()> {
    let api: Api<Elasticsearch> =
        Api::namespaced(ctx.client.clone(), &es.namespace().unwrap_or_default());
    let patch = json!({ "spec": { "init": { "initialized": true } } });
    api.patch(&es.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Install, replace or drop the cron entry; failures only raise an event
async fn schedule_backups(es: &Elasticsearch, ctx: &Context) {
    let ns = es.namespace().unwrap_or_default();
    let name = es.name_any();
    let Some(schedule) = &es.spec.backup_schedule else {
        ctx.cron.stop(&name, &ns);
        return;
    };
    if let Err(e) = ctx.cron.schedule(&name, &ns, es.object_ref(&()), schedule) {
        warn!(error = %e, "failed to schedule backups");
        ctx.warning(
            es,
            reasons::FAILED_TO_SCHEDULE,
            actions::BACKUP,
            format!("Failed to schedule snapshot. Reason: {e}"),
        )
        .await;
    }
}

async fn halt(es: &Elasticsearch, ctx: &Context, status: &mut StatusManager<'_>) -> Result<Action> {
    if *status.phase() == DatabasePhase::Halted {
        return Ok(Action::await_change());
    }
    if let Some(event) = halt_prelude(status.phase()) {
        status.transition(event, None).await?;
    }

    if let Err(e) = dormant::halt(ctx, es).await {
        ctx.warning(
            es,
            reasons::FAILED_TO_DELETE,
            actions::HALT,
            format!("Failed to halt Elasticsearch. Reason: {e}"),
        )
        .await;
        return Err(e);
    }
    if status
        .transition(DatabaseEvent::HaltRequested, None)
        .await?
        .is_none()
    {
        warn!(phase = %status.phase(), "halted, but the phase could not move to Halted");
    }
    ctx.normal(es, reasons::SUCCESSFUL, actions::HALT, "Halted Elasticsearch")
        .await;
    Ok(Action::await_change())
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(es: Arc<Elasticsearch>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    if error.is_retryable() {
        warn!(name = %es.name_any(), error = %error, ?delay, "retryable error, requeuing");
    } else {
        error!(name = %es.name_any(), error = %error, ?delay, "non-retryable error, requeuing");
    }
    Action::requeue(delay)
}

fn has_finalizer(es: &Elasticsearch) -> bool {
    es.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer(es: &Elasticsearch, ctx: &Context) -> Result<()> {
    let api: Api<Elasticsearch> =
        Api::namespaced(ctx.client.clone(), &es.namespace().unwrap_or_default());
    let mut finalizers = es.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&es.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!("added finalizer");
    Ok(())
}

async fn remove_finalizer(es: &Elasticsearch, ctx: &Context) -> Result<()> {
    let api: Api<Elasticsearch> =
        Api::namespaced(ctx.client.clone(), &es.namespace().unwrap_or_default());
    let finalizers: Vec<&String> = es.finalizers().iter().filter(|f| *f != FINALIZER).collect();
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&es.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!("removed finalizer");
    Ok(())
}

async fn handle_deletion(es: &Elasticsearch, ctx: &Context) -> Result<Action> {
    if !has_finalizer(es) {
        return Ok(Action::await_change());
    }

    // handed over to a dormant record; nothing of ours to clean up
    if es.annotations().contains_key(ANNOTATION_IGNORE) {
        remove_finalizer(es, ctx).await?;
        return Ok(Action::await_change());
    }

    match dormant::terminate(ctx, es).await {
        Ok(()) => {
            remove_finalizer(es, ctx).await?;
            info!(policy = ?es.spec.termination_policy, "deleted");
            Ok(Action::await_change())
        }
        Err(e) if e.is_user_error() => {
            ctx.warning(es, reasons::FAILED_TO_DELETE, actions::TERMINATE, e.to_string())
                .await;
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.warning(
                es,
                reasons::FAILED_TO_DELETE,
                actions::TERMINATE,
                format!("Failed to terminate Elasticsearch. Reason: {e}"),
            )
            .await;
            Err(e)
        }
    }
}
