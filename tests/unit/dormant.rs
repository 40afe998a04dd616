//! Unit tests for dormant records
//!
//! A halted database is frozen into a DormantDatabase and later resumed from
//! it; these tests cover the pure half of that protocol.

use crate::common::*;
use elasticsearch_operator::controller::Error;
use elasticsearch_operator::controller::dormant::{
    ANNOTATION_INIT_SPEC, check_dormant_match, frozen_spec, resumed_database,
};
use elasticsearch_operator::crd::{MonitorAgent, TerminationPolicy};
use elasticsearch_operator::resources::common::LABEL_DATABASE_KIND;
use kube::ResourceExt;

#[test]
fn test_frozen_spec_binds_secret_names() {
    let es = ElasticsearchBuilder::new("quick-es", "demo")
        .with_auth_secret("creds")
        .with_snapshot_source("snap-1")
        .build();
    let spec = frozen_spec(&es);

    assert!(spec.init.is_none());
    assert_eq!(spec.auth_secret.unwrap().secret_name, "creds");
    assert_eq!(spec.certificate_secret.unwrap().secret_name, "quick-es-cert");
}

#[test]
fn test_dormant_records_origin() {
    let es = ElasticsearchBuilder::new("quick-es", "demo")
        .with_label("team", "search")
        .with_termination_policy(TerminationPolicy::Halt)
        .build();
    let dormant = dormant_of(&es);

    assert_eq!(dormant.name_any(), "quick-es");
    assert_eq!(dormant.namespace().as_deref(), Some("demo"));
    assert_eq!(
        dormant.labels().get(LABEL_DATABASE_KIND).map(String::as_str),
        Some("Elasticsearch")
    );
    let origin = &dormant.spec.origin;
    assert_eq!(origin.metadata.labels.get("team").map(String::as_str), Some("search"));
    assert!(!dormant.spec.wipe_out);
    assert!(!dormant.spec.resume);
}

#[test]
fn test_resume_restores_database_marked_initialized() {
    let es = ElasticsearchBuilder::new("quick-es", "demo")
        .with_snapshot_source("snap-1")
        .build();
    let dormant = dormant_of(&es);
    assert!(dormant.annotations().contains_key(ANNOTATION_INIT_SPEC));

    let resumed = resumed_database(&dormant).unwrap();
    assert_eq!(resumed.name_any(), "quick-es");
    assert_eq!(resumed.namespace().as_deref(), Some("demo"));
    let init = resumed.spec.init.unwrap();
    assert!(init.initialized);
    assert_eq!(init.snapshot_source.unwrap().name, "snap-1");
}

#[test]
fn test_resume_without_init() {
    let es = create_test_database("quick-es", "demo", 3);
    let resumed = resumed_database(&dormant_of(&es)).unwrap();
    assert!(resumed.spec.init.is_none());
    assert_eq!(resumed.spec.replicas, Some(3));
}

#[test]
fn test_match_tolerates_overwritable_fields() {
    let es = create_test_database("quick-es", "demo", 3);
    let dormant = dormant_of(&es);

    let mut recreated = ElasticsearchBuilder::new("quick-es", "demo")
        .with_replicas(3)
        .with_monitor(MonitorAgent::PrometheusBuiltin)
        .with_backup_schedule("@daily", "gcs-secret", "backups")
        .build();
    recreated.spec.do_not_pause = true;
    assert!(check_dormant_match(&recreated, &dormant).is_ok());
}

#[test]
fn test_match_rejects_changed_storage() {
    let es = create_test_database("quick-es", "demo", 3);
    let dormant = dormant_of(&es);

    let mut recreated = es.clone();
    if let Some(storage) = recreated.spec.storage.as_mut() {
        storage.size = "10Gi".to_string();
    }
    assert!(matches!(
        check_dormant_match(&recreated, &dormant),
        Err(Error::SpecMismatch(_))
    ));
}

#[test]
fn test_match_rejects_other_kind() {
    let es = create_test_database("quick-es", "demo", 3);
    let mut dormant = dormant_of(&es);
    if let Some(labels) = dormant.metadata.labels.as_mut() {
        labels.insert(LABEL_DATABASE_KIND.to_string(), "MongoDB".to_string());
    }
    assert!(matches!(
        check_dormant_match(&es, &dormant),
        Err(Error::ValidationError(_))
    ));
}
