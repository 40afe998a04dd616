//! Unit tests for the database lifecycle state machine

use crate::common::*;
use elasticsearch_operator::controller::state_machine::{
    DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult,
};
use elasticsearch_operator::crd::DatabasePhase;

fn ctx() -> TransitionContext {
    TransitionContext::default()
}

#[test]
fn test_new_database_lifecycle() {
    let sm = DatabaseStateMachine::new();
    let mut phase = DatabasePhase::Empty;
    for event in [DatabaseEvent::CreationStarted, DatabaseEvent::ClusterFormed] {
        phase = sm.transition(&phase, event, &ctx()).target().unwrap();
    }
    assert_eq!(phase, DatabasePhase::Running);

    // updates keep a running database running
    let again = sm.transition(&phase, DatabaseEvent::ClusterFormed, &ctx());
    assert_eq!(again.target(), Some(DatabasePhase::Running));
}

#[test]
fn test_restore_lifecycle() {
    let sm = DatabaseStateMachine::new();
    let es = ElasticsearchBuilder::new("quick-es", "demo")
        .with_snapshot_source("snap-1")
        .build();
    let ctx = TransitionContext::for_database(&es);
    assert!(ctx.has_snapshot_source);

    let initializing = sm
        .transition(&DatabasePhase::Creating, DatabaseEvent::RestoreStarted, &ctx)
        .target()
        .unwrap();
    assert_eq!(initializing, DatabasePhase::Initializing);

    let done = sm.transition(&initializing, DatabaseEvent::RestoreSucceeded, &ctx);
    assert_eq!(done.target(), Some(DatabasePhase::Running));
    let failed = sm.transition(&initializing, DatabaseEvent::RestoreFailed, &ctx);
    assert_eq!(failed.target(), Some(DatabasePhase::Failed));
}

#[test]
fn test_restore_without_source_is_guarded() {
    let sm = DatabaseStateMachine::new();
    let es = create_test_database("quick-es", "demo", 1);
    let result = sm.transition(
        &DatabasePhase::Running,
        DatabaseEvent::RestoreStarted,
        &TransitionContext::for_database(&es),
    );
    assert!(matches!(result, TransitionResult::GuardFailed { .. }));
}

#[test]
fn test_halt_and_resume() {
    let sm = DatabaseStateMachine::new();
    let mut es = create_test_database("quick-es", "demo", 1);
    es.spec.halted = true;

    let halted = sm
        .transition(
            &DatabasePhase::Running,
            DatabaseEvent::HaltRequested,
            &TransitionContext::for_database(&es),
        )
        .target()
        .unwrap();
    assert_eq!(halted, DatabasePhase::Halted);

    // still halted: no resume
    let blocked = sm.transition(
        &halted,
        DatabaseEvent::Resumed,
        &TransitionContext::for_database(&es),
    );
    assert!(matches!(blocked, TransitionResult::GuardFailed { .. }));

    es.spec.halted = false;
    let resumed = sm.transition(
        &halted,
        DatabaseEvent::Resumed,
        &TransitionContext::for_database(&es),
    );
    assert_eq!(resumed.target(), Some(DatabasePhase::Creating));
}

#[test]
fn test_failed_leaves_through_retry_or_halt() {
    let sm = DatabaseStateMachine::new();
    assert_eq!(
        sm.next_phases(&DatabasePhase::Failed),
        [DatabasePhase::Creating, DatabasePhase::Halted]
    );
    assert!(sm.can_transition(&DatabasePhase::Failed, DatabaseEvent::RetryRequested));
    assert!(!sm.can_transition(&DatabasePhase::Failed, DatabaseEvent::ClusterFormed));
}

#[test]
fn test_interrupted_restore_can_restart_or_halt() {
    let sm = DatabaseStateMachine::new();
    let mut es = ElasticsearchBuilder::new("quick-es", "demo")
        .with_snapshot_source("snap-1")
        .build();

    let restarted = sm.transition(
        &DatabasePhase::Initializing,
        DatabaseEvent::RestoreStarted,
        &TransitionContext::for_database(&es),
    );
    assert_eq!(restarted.target(), Some(DatabasePhase::Initializing));

    es.spec.halted = true;
    let halted = sm.transition(
        &DatabasePhase::Initializing,
        DatabaseEvent::HaltRequested,
        &TransitionContext::for_database(&es),
    );
    assert_eq!(halted.target(), Some(DatabasePhase::Halted));
}

#[test]
fn test_invalid_transition_reports_current_phase() {
    let sm = DatabaseStateMachine::new();
    let result = sm.transition(&DatabasePhase::Empty, DatabaseEvent::RestoreSucceeded, &ctx());
    assert_eq!(
        result,
        TransitionResult::InvalidTransition {
            current: DatabasePhase::Empty,
            event: DatabaseEvent::RestoreSucceeded,
        }
    );
}
