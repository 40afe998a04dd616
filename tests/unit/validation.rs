//! Unit tests for admission validation
//!
//! Runs the full policy chain the validating webhook uses against builder
//! fixtures.

use crate::common::*;
use elasticsearch_operator::crd::{CertificateAlias, MonitorAgent, TerminationPolicy};
use elasticsearch_operator::webhooks::policies::{
    ValidationContext, ValidationFacts, ValidationResult, validate_all, validate_delete,
};

const MIN_MEMORY: &str = "256Mi";

fn facts(version: &str) -> ValidationFacts {
    ValidationFacts {
        version: Some(create_test_version(version)),
        unknown_storage_classes: Vec::new(),
    }
}

fn validate(es: &elasticsearch_operator::crd::Elasticsearch) -> ValidationResult {
    let facts = facts(&es.spec.version);
    validate_all(&ValidationContext::new(es, None, &facts, MIN_MEMORY))
}

mod create_tests {
    use super::*;

    #[test]
    fn test_builder_defaults_are_valid() {
        assert!(validate(&create_test_database("quick-es", "demo", 3)).allowed);
        assert!(validate(&ElasticsearchBuilder::topology("quick-es", "demo").build()).allowed);
    }

    #[test]
    fn test_fully_featured_database_is_valid() {
        let es = ElasticsearchBuilder::topology("quick-es", "demo")
            .with_ssl()
            .with_monitor(MonitorAgent::PrometheusOperator)
            .with_backup_schedule("@every 6h", "gcs-secret", "backups")
            .with_snapshot_source("snap-1")
            .with_termination_policy(TerminationPolicy::WipeOut)
            .build();
        let result = validate(&es);
        assert!(result.allowed, "{result:?}");
    }

    #[test]
    fn test_unknown_version_denied() {
        let es = create_test_database("quick-es", "demo", 1);
        let facts = ValidationFacts::default();
        let result = validate_all(&ValidationContext::new(&es, None, &facts, MIN_MEMORY));
        assert_eq!(result.reason.as_deref(), Some("UnknownVersion"));
    }

    #[test]
    fn test_unknown_storage_class_denied() {
        let es = create_test_database("quick-es", "demo", 1);
        let facts = ValidationFacts {
            unknown_storage_classes: vec!["standard".to_string()],
            ..facts("6.3")
        };
        let result = validate_all(&ValidationContext::new(&es, None, &facts, MIN_MEMORY));
        assert_eq!(result.reason.as_deref(), Some("UnknownStorageClass"));
    }

    #[test]
    fn test_durable_without_storage_denied() {
        let mut es = create_test_database("quick-es", "demo", 1);
        es.spec.storage = None;
        assert_eq!(validate(&es).reason.as_deref(), Some("MissingStorage"));
    }

    #[test]
    fn test_memory_floor() {
        let es = ElasticsearchBuilder::new("quick-es", "demo")
            .with_memory_request("128Mi")
            .build();
        assert_eq!(validate(&es).reason.as_deref(), Some("InsufficientMemory"));
    }

    #[test]
    fn test_ssl_needs_transport_and_admin() {
        let mut es = ElasticsearchBuilder::new("quick-es", "demo").with_ssl().build();
        if let Some(tls) = es.spec.tls.as_mut() {
            tls.certificates.retain(|c| c.alias != CertificateAlias::Admin);
        }
        assert_eq!(validate(&es).reason.as_deref(), Some("MissingTLSCertificates"));

        // without security the nodes need no certificates
        es.spec.disable_security = true;
        assert!(validate(&es).allowed);
    }

    #[test]
    fn test_bad_schedule_denied() {
        let es = ElasticsearchBuilder::new("quick-es", "demo")
            .with_backup_schedule("every tuesday", "gcs-secret", "backups")
            .build();
        assert_eq!(validate(&es).reason.as_deref(), Some("InvalidBackupSchedule"));
    }

    #[test]
    fn test_operator_monitor_needs_selector() {
        let mut es = ElasticsearchBuilder::new("quick-es", "demo")
            .with_monitor(MonitorAgent::PrometheusOperator)
            .build();
        if let Some(p) = es.spec.monitor.as_mut().and_then(|m| m.prometheus.as_mut()) {
            p.labels.clear();
        }
        assert_eq!(validate(&es).reason.as_deref(), Some("InvalidMonitor"));
    }
}

mod update_tests {
    use super::*;

    #[test]
    fn test_scaling_is_allowed() {
        let old = create_test_database("quick-es", "demo", 1);
        let new = create_test_database("quick-es", "demo", 3);
        let facts = facts("6.3");
        assert!(validate_all(&ValidationContext::new(&new, Some(&old), &facts, MIN_MEMORY)).allowed);
    }

    #[test]
    fn test_storage_change_denied() {
        let old = create_test_database("quick-es", "demo", 1);
        let mut new = old.clone();
        if let Some(storage) = new.spec.storage.as_mut() {
            storage.size = "5Gi".to_string();
        }
        let facts = facts("6.3");
        let result = validate_all(&ValidationContext::new(&new, Some(&old), &facts, MIN_MEMORY));
        assert_eq!(result.reason.as_deref(), Some("ImmutableField"));
        assert_eq!(
            result.message.as_deref(),
            Some("spec.storage cannot be changed after creation")
        );
    }

    #[test]
    fn test_switching_to_topology_denied() {
        let old = create_test_database("quick-es", "demo", 1);
        let new = ElasticsearchBuilder::topology("quick-es", "demo").build();
        let facts = facts("6.3");
        let result = validate_all(&ValidationContext::new(&new, Some(&old), &facts, MIN_MEMORY));
        assert!(!result.allowed);
    }

    #[test]
    fn test_status_only_update_skips_policies() {
        let old = create_test_database("quick-es", "demo", 1);
        let new = old.clone();
        let facts = ValidationFacts::default();
        assert!(validate_all(&ValidationContext::new(&new, Some(&old), &facts, MIN_MEMORY)).allowed);
    }
}

mod delete_tests {
    use super::*;

    #[test]
    fn test_do_not_terminate_blocks_delete() {
        let es = ElasticsearchBuilder::new("quick-es", "demo")
            .with_termination_policy(TerminationPolicy::DoNotTerminate)
            .build();
        let result = validate_delete(Some(&es));
        assert!(!result.allowed);
        assert_eq!(
            result.message.as_deref(),
            Some("elasticsearch \"quick-es\" can't be deleted. To delete, change spec.terminationPolicy")
        );
    }

    #[test]
    fn test_other_policies_allow_delete() {
        for policy in [
            TerminationPolicy::Halt,
            TerminationPolicy::Delete,
            TerminationPolicy::WipeOut,
        ] {
            let es = ElasticsearchBuilder::new("quick-es", "demo")
                .with_termination_policy(policy)
                .build();
            assert!(validate_delete(Some(&es)).allowed);
        }
        assert!(validate_delete(None).allowed);
    }
}
