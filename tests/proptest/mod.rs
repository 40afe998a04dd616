// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for Elasticsearch admission and resource generation
//!
//! These tests use proptest to generate random configurations and verify that:
//! 1. Defaulting is idempotent and defaulted specs pass validation
//! 2. Resource generation never panics and keeps selectors consistent
//! 3. The state machine never panics and only moves along its table
//! 4. Dormant records always match the database they were taken from

#[path = "../common/mod.rs"]
mod common;

use proptest::prelude::*;
use std::time::Duration;

use common::ElasticsearchBuilder;
use elasticsearch_operator::config::OperatorConfig;
use elasticsearch_operator::controller::cron::{Schedule, parse_duration};
use elasticsearch_operator::controller::dormant::{
    check_dormant_match, dormant_for, frozen_spec, resumed_database,
};
use elasticsearch_operator::controller::state_machine::{
    DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult,
};
use elasticsearch_operator::controller::validation::parse_quantity;
use elasticsearch_operator::crd::{
    DatabasePhase, Elasticsearch, ElasticsearchVersion, ElasticsearchVersionSpec, ImageRef,
    MonitorAgent, ResourceList, TerminationPolicy,
};
use elasticsearch_operator::resources::common::{Verb, json_subset};
use elasticsearch_operator::resources::statefulset::{
    WorkloadSettings, generate_statefulset, node_groups, number_of_masters,
};
use elasticsearch_operator::webhooks::mutator::set_defaults;
use elasticsearch_operator::webhooks::policies::{ValidationContext, ValidationFacts, validate_all};

// =============================================================================
// Strategies
// =============================================================================

fn version() -> impl Strategy<Value = String> {
    prop_oneof![Just("5.6"), Just("6.2"), Just("6.3"), Just("7.2")].prop_map(String::from)
}

/// Memory quantities at or above the 256Mi floor
fn memory_value() -> impl Strategy<Value = String> {
    prop_oneof![
        (256u32..4096).prop_map(|n| format!("{n}Mi")),
        (1u32..16).prop_map(|n| format!("{n}Gi")),
    ]
}

fn termination_policy() -> impl Strategy<Value = TerminationPolicy> {
    prop_oneof![
        Just(TerminationPolicy::DoNotTerminate),
        Just(TerminationPolicy::Halt),
        Just(TerminationPolicy::Delete),
        Just(TerminationPolicy::WipeOut),
    ]
}

fn monitor_agent() -> impl Strategy<Value = Option<MonitorAgent>> {
    prop_oneof![
        Just(None),
        Just(Some(MonitorAgent::PrometheusBuiltin)),
        Just(Some(MonitorAgent::PrometheusOperator)),
    ]
}

/// Databases as a user might submit them, before defaulting
fn database() -> impl Strategy<Value = Elasticsearch> {
    (
        version(),
        any::<bool>(),
        proptest::option::of(1i32..9),
        proptest::option::of(memory_value()),
        proptest::option::of(memory_value()),
        termination_policy(),
        monitor_agent(),
        any::<bool>(),
    )
        .prop_map(
            |(version, topology, replicas, request, limit, policy, agent, ephemeral)| {
                let mut builder = if topology {
                    ElasticsearchBuilder::topology("quick-es", "demo")
                } else {
                    ElasticsearchBuilder::new("quick-es", "demo")
                };
                builder = builder
                    .with_version(&version)
                    .with_termination_policy(policy)
                    .without_memory_request();
                if ephemeral {
                    builder = builder.ephemeral();
                }
                if let Some(agent) = agent {
                    builder = builder.with_monitor(agent);
                }

                let mut es = builder.build();
                if !topology {
                    es.spec.replicas = replicas;
                }
                let resources = &mut es.spec.pod_template.spec.resources;
                resources.requests = request.map(|memory| ResourceList {
                    cpu: None,
                    memory: Some(memory),
                });
                resources.limits = limit.map(|memory| ResourceList {
                    cpu: None,
                    memory: Some(memory),
                });
                es
            },
        )
}

fn database_phase() -> impl Strategy<Value = DatabasePhase> {
    prop_oneof![
        Just(DatabasePhase::Empty),
        Just(DatabasePhase::Creating),
        Just(DatabasePhase::Initializing),
        Just(DatabasePhase::Running),
        Just(DatabasePhase::Halted),
        Just(DatabasePhase::Failed),
    ]
}

fn database_event() -> impl Strategy<Value = DatabaseEvent> {
    prop_oneof![
        Just(DatabaseEvent::CreationStarted),
        Just(DatabaseEvent::ClusterFormed),
        Just(DatabaseEvent::RestoreStarted),
        Just(DatabaseEvent::RestoreSucceeded),
        Just(DatabaseEvent::RestoreFailed),
        Just(DatabaseEvent::HaltRequested),
        Just(DatabaseEvent::Resumed),
        Just(DatabaseEvent::RetryRequested),
    ]
}

fn verb() -> impl Strategy<Value = Verb> {
    prop_oneof![Just(Verb::Unchanged), Just(Verb::Created), Just(Verb::Patched)]
}

fn catalog(version: &str) -> ElasticsearchVersion {
    ElasticsearchVersion::new(
        version,
        ElasticsearchVersionSpec {
            version: version.to_string(),
            db: ImageRef {
                image: format!("kubedb/elasticsearch:{version}"),
            },
            exporter: None,
            tools: None,
            auth_plugin: Default::default(),
            deprecated: false,
        },
    )
}

fn defaulted(mut es: Elasticsearch) -> Elasticsearch {
    set_defaults(&mut es, None).unwrap();
    es
}

// =============================================================================
// Property-based tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: defaulting twice changes nothing the first pass did not
    #[test]
    fn prop_defaults_idempotent(es in database()) {
        let once = defaulted(es);
        let twice = defaulted(once.clone());
        prop_assert_eq!(once, twice);
    }

    /// Property: every node group has a replica count and memory request after defaulting
    #[test]
    fn prop_defaults_fill_every_group(es in database()) {
        let es = defaulted(es);
        for group in node_groups(&es) {
            prop_assert!(group.replicas >= 1, "{} has {} replicas", group.name, group.replicas);
            let request = group.resources.memory_request().unwrap();
            prop_assert!(parse_quantity(request).unwrap() > 0.0);
        }
    }

    /// Property: defaulted databases pass admission
    #[test]
    fn prop_defaulted_database_is_valid(es in database()) {
        let es = defaulted(es);
        let facts = ValidationFacts {
            version: Some(catalog(&es.spec.version)),
            unknown_storage_classes: Vec::new(),
        };
        let result = validate_all(&ValidationContext::new(&es, None, &facts, "256Mi"));
        prop_assert!(result.allowed, "{:?}", result);
    }

    /// Property: workloads are generated without panicking and select their own pods
    #[test]
    fn prop_statefulsets_select_own_pods(es in database()) {
        let es = defaulted(es);
        let images = OperatorConfig::default().images(&es.spec.version, None);
        let settings = WorkloadSettings {
            governing_service: "kubedb",
            enable_rbac: true,
            images: &images,
        };
        for group in node_groups(&es) {
            let spec = generate_statefulset(&es, &group, &settings).spec.unwrap();
            prop_assert_eq!(spec.replicas, Some(group.replicas));
            let selector = spec.selector.match_labels.unwrap();
            let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
            for (key, value) in &selector {
                prop_assert_eq!(pod_labels.get(key), Some(value));
            }
        }
    }

    /// Property: master count is always a strict majority
    #[test]
    fn prop_number_of_masters_is_majority(replicas in 0i32..10_000) {
        let masters = number_of_masters(replicas);
        prop_assert!(masters >= 1);
        prop_assert!(masters * 2 > replicas);
        prop_assert!(masters <= replicas.max(1));
    }

    /// Property: composing verbs follows created > patched > unchanged precedence
    #[test]
    fn prop_verb_compose(verbs in proptest::collection::vec(verb(), 0..6)) {
        let composed = Verb::compose(&verbs);
        if !verbs.is_empty() && verbs.iter().all(|v| *v == Verb::Created) {
            prop_assert_eq!(composed, Verb::Created);
        } else if verbs.contains(&Verb::Patched) {
            prop_assert_eq!(composed, Verb::Patched);
        } else {
            prop_assert_eq!(composed, Verb::Unchanged);
        }
    }

    /// Property: an object is always a subset of itself
    #[test]
    fn prop_json_subset_reflexive(es in database()) {
        let value = serde_json::to_value(&es).unwrap();
        prop_assert!(json_subset(&value, &value));
    }

    /// Property: state machine never panics, and successes land on a listed next phase
    #[test]
    fn prop_state_machine_moves_along_table(
        phase in database_phase(),
        event in database_event(),
        halted in any::<bool>(),
        has_snapshot_source in any::<bool>(),
    ) {
        let sm = DatabaseStateMachine::new();
        let ctx = TransitionContext { halted, has_snapshot_source };
        match sm.transition(&phase, event, &ctx) {
            TransitionResult::Success { to, .. } => {
                prop_assert!(sm.next_phases(&phase).contains(&to));
                prop_assert!(sm.can_transition(&phase, event));
            }
            TransitionResult::GuardFailed { .. } => {
                prop_assert!(sm.can_transition(&phase, event));
            }
            TransitionResult::InvalidTransition { current, .. } => {
                prop_assert_eq!(current, phase.clone());
                prop_assert!(!sm.can_transition(&phase, event));
            }
        }
    }

    /// Property: a database always matches its own dormant record
    #[test]
    fn prop_dormant_matches_origin(es in database()) {
        let es = defaulted(es);
        let dormant = dormant_for(&es).unwrap();
        prop_assert!(check_dormant_match(&es, &dormant).is_ok());

        let resumed = resumed_database(&dormant).unwrap();
        prop_assert_eq!(resumed.spec, frozen_spec(&es));
    }

    /// Property: `@every` schedules fire exactly one interval later
    #[test]
    fn prop_every_schedule_interval(hours in 0u64..48, minutes in 0u64..60, seconds in 1u64..60) {
        let expression = format!("@every {hours}h{minutes}m{seconds}s");
        let schedule: Schedule = expression.parse().unwrap();
        let expected = Duration::from_secs(hours * 3600 + minutes * 60 + seconds);
        prop_assert_eq!(parse_duration(&expression["@every ".len()..]).unwrap(), expected);

        let now = chrono::Utc::now();
        let next = schedule.next_after(now).unwrap();
        prop_assert_eq!((next - now).num_seconds() as u64, expected.as_secs());
    }

    /// Property: quantities below the floor are rejected, others accepted
    #[test]
    fn prop_memory_floor(mebibytes in 1u32..2048) {
        let es = ElasticsearchBuilder::new("quick-es", "demo")
            .with_memory_request(&format!("{mebibytes}Mi"))
            .build();
        let facts = ValidationFacts {
            version: Some(catalog(&es.spec.version)),
            unknown_storage_classes: Vec::new(),
        };
        let result = validate_all(&ValidationContext::new(&es, None, &facts, "256Mi"));
        prop_assert_eq!(result.allowed, mebibytes >= 256, "{:?}", result);
    }
}
