//! Finite state machine for the Elasticsearch lifecycle
//!
//! Every phase change the reconciler makes goes through
//! [`DatabaseStateMachine::transition`], so a phase can only move along the
//! edges of the table below. Guards are checked against a
//! [`TransitionContext`] built from the observed object.

use std::fmt;

use crate::crd::DatabasePhase;

/// Events that move a database between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseEvent {
    /// First reconcile of a new object
    CreationStarted,
    /// Workloads applied and the cluster had time to form
    ClusterFormed,
    /// A restore from `init.snapshotSource` is starting
    RestoreStarted,
    /// The restore job completed
    RestoreSucceeded,
    /// The restore job failed or timed out
    RestoreFailed,
    /// `spec.halted` was set
    HaltRequested,
    /// `spec.halted` was cleared
    Resumed,
    /// A failed database is reconciled again after a spec change
    RetryRequested,
}

impl fmt::Display for DatabaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatabaseEvent::CreationStarted => "CreationStarted",
            DatabaseEvent::ClusterFormed => "ClusterFormed",
            DatabaseEvent::RestoreStarted => "RestoreStarted",
            DatabaseEvent::RestoreSucceeded => "RestoreSucceeded",
            DatabaseEvent::RestoreFailed => "RestoreFailed",
            DatabaseEvent::HaltRequested => "HaltRequested",
            DatabaseEvent::Resumed => "Resumed",
            DatabaseEvent::RetryRequested => "RetryRequested",
        };
        write!(f, "{s}")
    }
}

/// Facts about the object the guards look at
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub halted: bool,
    pub has_snapshot_source: bool,
}

impl TransitionContext {
    pub fn for_database(es: &crate::crd::Elasticsearch) -> Self {
        Self {
            halted: es.spec.halted,
            has_snapshot_source: es
                .spec
                .init
                .as_ref()
                .is_some_and(|i| i.snapshot_source.is_some()),
        }
    }
}

#[derive(Debug)]
pub struct Transition {
    pub from: DatabasePhase,
    pub to: DatabasePhase,
    pub event: DatabaseEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: DatabasePhase,
        to: DatabasePhase,
        event: DatabaseEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum TransitionResult {
    Success {
        from: DatabasePhase,
        to: DatabasePhase,
        event: DatabaseEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: DatabasePhase,
        event: DatabaseEvent,
    },
    GuardFailed {
        from: DatabasePhase,
        to: DatabasePhase,
        event: DatabaseEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase when the transition is allowed
    pub fn target(&self) -> Option<DatabasePhase> {
        match self {
            TransitionResult::Success { to, .. } => Some(to.clone()),
            _ => None,
        }
    }
}

pub struct DatabaseStateMachine {
    transitions: Vec<Transition>,
}

impl Default for DatabaseStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseStateMachine {
    pub fn new() -> Self {
        use DatabaseEvent as E;
        use DatabasePhase as P;

        Self {
            transitions: vec![
                Transition::new(P::Empty, P::Creating, E::CreationStarted, "Creating database"),
                Transition::new(
                    P::Creating,
                    P::Running,
                    E::ClusterFormed,
                    "Cluster formed, database is running",
                ),
                Transition::new(
                    P::Creating,
                    P::Initializing,
                    E::RestoreStarted,
                    "Initializing from snapshot",
                ),
                Transition::new(
                    P::Creating,
                    P::Failed,
                    E::RestoreFailed,
                    "Initialization failed",
                ),
                Transition::new(P::Creating, P::Halted, E::HaltRequested, "Halting database"),
                Transition::new(
                    P::Running,
                    P::Running,
                    E::ClusterFormed,
                    "Workloads updated",
                ),
                Transition::new(
                    P::Running,
                    P::Initializing,
                    E::RestoreStarted,
                    "Initializing from snapshot",
                ),
                Transition::new(P::Running, P::Halted, E::HaltRequested, "Halting database"),
                Transition::new(
                    P::Initializing,
                    P::Running,
                    E::RestoreSucceeded,
                    "Initialization complete",
                ),
                Transition::new(
                    P::Initializing,
                    P::Failed,
                    E::RestoreFailed,
                    "Initialization failed",
                ),
                Transition::new(
                    P::Initializing,
                    P::Initializing,
                    E::RestoreStarted,
                    "Restarting interrupted initialization",
                ),
                Transition::new(
                    P::Initializing,
                    P::Halted,
                    E::HaltRequested,
                    "Halting database during initialization",
                ),
                Transition::new(P::Failed, P::Halted, E::HaltRequested, "Halting failed database"),
                Transition::new(P::Halted, P::Creating, E::Resumed, "Resuming halted database"),
                Transition::new(
                    P::Failed,
                    P::Creating,
                    E::RetryRequested,
                    "Recreating failed database",
                ),
            ],
        }
    }

    pub fn transition(
        &self,
        current: &DatabasePhase,
        event: DatabaseEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let Some(t) = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event)
        else {
            return TransitionResult::InvalidTransition {
                current: current.clone(),
                event,
            };
        };

        match self.check_guard(t, ctx) {
            Some(reason) => TransitionResult::GuardFailed {
                from: t.from.clone(),
                to: t.to.clone(),
                event,
                reason,
            },
            None => TransitionResult::Success {
                from: t.from.clone(),
                to: t.to.clone(),
                event,
                description: t.description,
            },
        }
    }

    /// Check if a transition exists (ignoring guards)
    pub fn can_transition(&self, from: &DatabasePhase, event: DatabaseEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == event)
    }

    /// Phases reachable from `state` in one step
    pub fn next_phases(&self, state: &DatabasePhase) -> Vec<DatabasePhase> {
        let mut phases: Vec<DatabasePhase> = Vec::new();
        for t in self.transitions.iter().filter(|t| t.from == *state) {
            if !phases.contains(&t.to) {
                phases.push(t.to.clone());
            }
        }
        phases
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            DatabaseEvent::HaltRequested if !ctx.halted => {
                Some("spec.halted is not set".to_string())
            }
            DatabaseEvent::Resumed if ctx.halted => Some("spec.halted is still set".to_string()),
            DatabaseEvent::RestoreStarted if !ctx.has_snapshot_source => {
                Some("no snapshot source to restore from".to_string())
            }
            _ => None,
        }
    }
}
