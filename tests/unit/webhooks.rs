//! Unit tests for admission defaulting

use crate::common::*;
use elasticsearch_operator::controller::Error;
use elasticsearch_operator::crd::{MonitorAgent, ResourceList, SecretReference};
use elasticsearch_operator::resources::monitor::DEFAULT_EXPORTER_PORT;
use elasticsearch_operator::webhooks::mutator::{DEFAULT_MEMORY_REQUEST, spec_diff};
use elasticsearch_operator::webhooks::{mutate, set_defaults};

mod defaulting_tests {
    use super::*;

    #[test]
    fn test_missing_memory_request_defaulted() {
        let mut es = ElasticsearchBuilder::new("quick-es", "demo")
            .without_memory_request()
            .build();
        es.spec.replicas = None;
        set_defaults(&mut es, None).unwrap();

        assert_eq!(es.spec.replicas, Some(1));
        assert_eq!(
            es.spec.pod_template.spec.resources.memory_request(),
            Some(DEFAULT_MEMORY_REQUEST)
        );
    }

    #[test]
    fn test_memory_limit_becomes_request() {
        let mut es = ElasticsearchBuilder::new("quick-es", "demo")
            .without_memory_request()
            .build();
        es.spec.pod_template.spec.resources.limits = Some(ResourceList {
            cpu: None,
            memory: Some("2Gi".to_string()),
        });
        set_defaults(&mut es, None).unwrap();
        assert_eq!(
            es.spec.pod_template.spec.resources.memory_request(),
            Some("2Gi")
        );
    }

    #[test]
    fn test_topology_nodes_defaulted_individually() {
        let mut es = ElasticsearchBuilder::topology("quick-es", "demo").build();
        if let Some(topology) = es.spec.topology.as_mut() {
            topology.data.replicas = None;
            topology.data.resources = Default::default();
        }
        set_defaults(&mut es, None).unwrap();

        let topology = es.spec.topology.unwrap();
        assert_eq!(topology.data.replicas, Some(1));
        assert_eq!(topology.data.resources.memory_request(), Some(DEFAULT_MEMORY_REQUEST));
        assert_eq!(topology.master.replicas, Some(3));
        assert_eq!(topology.master.resources.memory_request(), Some("512Mi"));
        assert!(es.spec.replicas.is_none());
    }

    #[test]
    fn test_monitor_port_defaulted() {
        let mut es = ElasticsearchBuilder::new("quick-es", "demo")
            .with_monitor(MonitorAgent::PrometheusOperator)
            .build();
        set_defaults(&mut es, None).unwrap();
        let port = es.spec.monitor.unwrap().prometheus.unwrap().port;
        assert_eq!(port, DEFAULT_EXPORTER_PORT);
    }

    #[test]
    fn test_defaults_are_idempotent() {
        let mut once = ElasticsearchBuilder::topology("quick-es", "demo")
            .with_monitor(MonitorAgent::PrometheusBuiltin)
            .build();
        set_defaults(&mut once, None).unwrap();
        let mut twice = once.clone();
        set_defaults(&mut twice, None).unwrap();
        assert_eq!(once, twice);
        assert!(mutate(&twice, None).unwrap().0.is_empty());
    }

    #[test]
    fn test_missing_version_rejected() {
        let es = ElasticsearchBuilder::new("quick-es", "demo").with_version("").build();
        assert!(matches!(mutate(&es, None), Err(Error::ValidationError(_))));
    }
}

mod dormant_tests {
    use super::*;

    #[test]
    fn test_resume_fills_generated_secret_names() {
        let original = create_test_database("quick-es", "demo", 3);
        let dormant = dormant_of(&original);

        let mut recreated = create_test_database("quick-es", "demo", 3);
        set_defaults(&mut recreated, Some(&dormant)).unwrap();
        assert_eq!(
            recreated.spec.auth_secret,
            Some(SecretReference::new("quick-es-auth"))
        );
        assert_eq!(
            recreated.spec.certificate_secret,
            Some(SecretReference::new("quick-es-cert"))
        );
    }

    #[test]
    fn test_resume_may_change_schedule_and_monitor() {
        let original = create_test_database("quick-es", "demo", 3);
        let dormant = dormant_of(&original);

        let mut recreated = ElasticsearchBuilder::new("quick-es", "demo")
            .with_replicas(3)
            .with_backup_schedule("@every 1h", "gcs-secret", "backups")
            .with_monitor(MonitorAgent::PrometheusBuiltin)
            .build();
        assert!(set_defaults(&mut recreated, Some(&dormant)).is_ok());
    }

    #[test]
    fn test_resume_with_different_layout_rejected() {
        let original = create_test_database("quick-es", "demo", 3);
        let dormant = dormant_of(&original);

        let mut recreated = create_test_database("quick-es", "demo", 5);
        let err = set_defaults(&mut recreated, Some(&dormant)).unwrap_err();
        let Error::SpecMismatch(diff) = err else {
            panic!("expected a spec mismatch, got {err:?}");
        };
        assert!(diff.contains("/replicas"), "{diff}");
    }

    #[test]
    fn test_spec_diff_is_empty_for_equal_specs() {
        let es = create_test_database("quick-es", "demo", 1);
        assert_eq!(spec_diff(&es.spec, &es.spec).unwrap(), "[]");
    }
}
