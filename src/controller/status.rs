//! Status and conditions management for Elasticsearch resources

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::{debug, warn};

use crate::controller::Context;
use crate::controller::error::Result;
use crate::controller::state_machine::{
    DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult,
};
use crate::crd::{Condition, DatabasePhase, Elasticsearch, ElasticsearchStatus};
use crate::resources::common::FIELD_MANAGER;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    pub const READY: &str = "Ready";
    pub const PROGRESSING: &str = "Progressing";
}

pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, keeping its transition time when the status holds
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        let status = if is_ready {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(condition_types::READY, status, reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        let status = if is_progressing {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(condition_types::PROGRESSING, status, reason, message)
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Status the database should carry after entering `phase`
pub fn status_for_phase(
    previous: &ElasticsearchStatus,
    generation: Option<i64>,
    phase: DatabasePhase,
    reason: Option<String>,
) -> ElasticsearchStatus {
    let message = reason.clone().unwrap_or_default();

    let builder = ConditionBuilder::from_existing(previous.conditions.clone(), generation);
    let conditions = match phase {
        DatabasePhase::Running => builder
            .ready(true, "Running", "Database is running")
            .progressing(false, "Stable", "Database is stable"),
        DatabasePhase::Creating | DatabasePhase::Empty => builder
            .ready(false, "Creating", "Database is being created")
            .progressing(true, "CreatingResources", "Creating dependent objects"),
        DatabasePhase::Initializing => builder
            .ready(false, "Initializing", "Restoring from snapshot")
            .progressing(true, "Restoring", "Restore job is running"),
        DatabasePhase::Halted => builder
            .ready(false, "Halted", "Database is halted")
            .progressing(false, "Halted", "Workloads removed, volumes kept"),
        DatabasePhase::Failed => builder
            .ready(false, "Failed", &message)
            .progressing(false, "Failed", &message),
    }
    .build();

    ElasticsearchStatus {
        creation_time: previous
            .creation_time
            .clone()
            .or_else(|| Some(Utc::now().to_rfc3339())),
        phase,
        reason,
        observed_generation: generation,
        conditions,
    }
}

/// True while the spec has not been reconciled at its current generation
pub fn spec_changed(es: &Elasticsearch) -> bool {
    let observed = es.status.as_ref().and_then(|s| s.observed_generation);
    observed != es.metadata.generation
}

/// Writes phase changes to the status subresource
///
/// Tracks the status it last wrote, so several transitions within one
/// reconcile see each other.
pub struct StatusManager<'a> {
    es: &'a Elasticsearch,
    ctx: &'a Context,
    state_machine: DatabaseStateMachine,
    status: ElasticsearchStatus,
}

impl<'a> StatusManager<'a> {
    pub fn new(es: &'a Elasticsearch, ctx: &'a Context) -> Self {
        Self {
            es,
            ctx,
            state_machine: DatabaseStateMachine::new(),
            status: es.status.clone().unwrap_or_default(),
        }
    }

    pub fn phase(&self) -> &DatabasePhase {
        &self.status.phase
    }

    async fn update(&mut self, status: ElasticsearchStatus) -> Result<()> {
        let api: Api<Elasticsearch> = Api::namespaced(
            self.ctx.client.clone(),
            &self.es.namespace().unwrap_or_default(),
        );
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            &self.es.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        self.status = status;
        Ok(())
    }

    /// Move to the phase `event` leads to; returns it when the move was allowed
    pub async fn transition(
        &mut self,
        event: DatabaseEvent,
        reason: Option<String>,
    ) -> Result<Option<DatabasePhase>> {
        let tctx = TransitionContext::for_database(self.es);
        let current = self.status.phase.clone();
        match self.state_machine.transition(&current, event, &tctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                debug!(%from, %to, %event, description, "phase transition");
                let status =
                    status_for_phase(&self.status, self.es.metadata.generation, to.clone(), reason);
                self.update(status).await?;
                Ok(Some(to))
            }
            TransitionResult::GuardFailed { reason, .. } => {
                warn!(%current, %event, %reason, "transition guard failed");
                Ok(None)
            }
            TransitionResult::InvalidTransition { current, event } => {
                debug!(%current, %event, "no transition for event");
                Ok(None)
            }
        }
    }

    /// Record a failure reason without leaving the current phase
    pub async fn set_reason(&mut self, reason: &str) -> Result<()> {
        let status = status_for_phase(
            &self.status,
            self.status.observed_generation,
            self.status.phase.clone(),
            Some(reason.to_string()),
        );
        self.update(status).await
    }

    /// Mark the current generation as observed without changing phase
    pub async fn observe(&mut self) -> Result<()> {
        if self.status.observed_generation == self.es.metadata.generation {
            return Ok(());
        }
        let mut status = self.status.clone();
        status.observed_generation = self.es.metadata.generation;
        status.reason = None;
        self.update(status).await
    }
}
