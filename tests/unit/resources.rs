//! Unit tests for resource generators
//!
//! Workloads, services, secrets and monitors are generated from the builder
//! fixtures and checked for the names, selectors and ports the rest of the
//! operator relies on.

use crate::common::*;
use elasticsearch_operator::config::OperatorConfig;
use elasticsearch_operator::crd::{Elasticsearch, MonitorAgent};
use elasticsearch_operator::resources::statefulset::{
    NodeGroup, NodeRole, WorkloadSettings, generate_statefulset, node_groups, number_of_masters,
};
use elasticsearch_operator::resources::{jobs, monitor, secret, service};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;

fn build_statefulset(es: &Elasticsearch, group: &NodeGroup) -> StatefulSet {
    let images = OperatorConfig::default().images(&es.spec.version, None);
    let settings = WorkloadSettings {
        governing_service: "kubedb",
        enable_rbac: false,
        images: &images,
    };
    generate_statefulset(es, group, &settings)
}

mod node_group_tests {
    use super::*;

    #[test]
    fn test_combined_mode_single_group() {
        let es = create_test_database("quick-es", "demo", 3);
        let groups = node_groups(&es);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].role, NodeRole::Combined);
        assert_eq!(groups[0].name, "quick-es");
        assert_eq!(groups[0].replicas, 3);
    }

    #[test]
    fn test_topology_groups_in_apply_order() {
        let es = ElasticsearchBuilder::topology("quick-es", "demo").build();
        let groups = node_groups(&es);

        let roles: Vec<_> = groups.iter().map(|g| g.role).collect();
        assert_eq!(roles, [NodeRole::Client, NodeRole::Master, NodeRole::Data]);
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["client-quick-es", "master-quick-es", "data-quick-es"]);
        let replicas: Vec<_> = groups.iter().map(|g| g.replicas).collect();
        assert_eq!(replicas, [1, 3, 2]);
    }

    #[test]
    fn test_masters_form_a_quorum() {
        for replicas in 1..10 {
            let masters = number_of_masters(replicas);
            assert!(masters * 2 > replicas, "{masters} of {replicas}");
        }
    }
}

mod statefulset_tests {
    use super::*;

    #[test]
    fn test_statefulset_identity() {
        let es = create_test_database("quick-es", "demo", 2);
        let groups = node_groups(&es);
        let sts = build_statefulset(&es, &groups[0]);

        assert_eq!(sts.name_any(), "quick-es");
        assert_eq!(sts.namespace().as_deref(), Some("demo"));
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.service_name.as_deref(), Some("kubedb"));

        let owner = &sts.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Elasticsearch");
        assert_eq!(owner.name, "quick-es");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_durable_storage_uses_claim_template() {
        let es = create_test_database("quick-es", "demo", 1);
        let groups = node_groups(&es);
        let sts = build_statefulset(&es, &groups[0]);

        let claims = sts.spec.unwrap().volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn test_ephemeral_storage_uses_empty_dir() {
        let es = ElasticsearchBuilder::new("quick-es", "demo").ephemeral().build();
        let groups = node_groups(&es);
        let spec = build_statefulset(&es, &groups[0]).spec.unwrap();

        assert!(spec.volume_claim_templates.is_none());
        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        let data = volumes.iter().find(|v| v.name == "data").unwrap();
        assert!(data.empty_dir.is_some());
    }

    #[test]
    fn test_selector_matches_pod_labels() {
        let es = ElasticsearchBuilder::topology("quick-es", "demo").build();
        for group in node_groups(&es) {
            let spec = build_statefulset(&es, &group).spec.unwrap();
            let selector = spec.selector.match_labels.unwrap();
            let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
            for (key, value) in &selector {
                assert_eq!(pod_labels.get(key), Some(value), "{} label {key}", group.name);
            }
        }
    }

    #[test]
    fn test_only_http_groups_get_exporter() {
        let es = ElasticsearchBuilder::topology("quick-es", "demo")
            .with_monitor(MonitorAgent::PrometheusBuiltin)
            .build();
        for group in node_groups(&es) {
            let pod = build_statefulset(&es, &group).spec.unwrap().template.spec.unwrap();
            let has_exporter = pod.containers.iter().any(|c| c.name == "exporter");
            assert_eq!(has_exporter, group.role.serves_http(), "{}", group.name);
        }
    }
}

mod service_tests {
    use super::*;

    #[test]
    fn test_client_service_selects_client_nodes() {
        let es = create_test_database("quick-es", "demo", 1);
        let svc = service::generate_client_service(&es);

        assert_eq!(svc.name_any(), "quick-es");
        let spec = svc.spec.unwrap();
        let selector = spec.selector.unwrap();
        assert_eq!(selector.get("node.role.client"), Some(&"set".to_string()));
        assert_eq!(selector.get("kubedb.com/name"), Some(&"quick-es".to_string()));
        assert_eq!(spec.ports.unwrap()[0].port, 9200);
    }

    #[test]
    fn test_master_service_uses_transport_port() {
        let es = create_test_database("quick-es", "demo", 1);
        let svc = service::generate_master_service(&es);

        assert_eq!(svc.name_any(), "quick-es-master");
        let spec = svc.spec.unwrap();
        assert_eq!(
            spec.selector.unwrap().get("node.role.master"),
            Some(&"set".to_string())
        );
        assert_eq!(spec.ports.unwrap()[0].port, 9300);
    }

    #[test]
    fn test_stats_service_follows_monitor() {
        let plain = create_test_database("quick-es", "demo", 1);
        assert!(service::generate_stats_service(&plain).is_none());

        let builtin = ElasticsearchBuilder::new("quick-es", "demo")
            .with_monitor(MonitorAgent::PrometheusBuiltin)
            .build();
        let svc = service::generate_stats_service(&builtin).unwrap();
        assert_eq!(svc.name_any(), "quick-es-stats");
        let annotations = svc.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get("prometheus.io/port"),
            Some(&monitor::DEFAULT_EXPORTER_PORT.to_string())
        );
    }

    #[test]
    fn test_governing_service_is_headless() {
        let svc = service::generate_governing_service("kubedb", "demo");
        assert_eq!(svc.spec.unwrap().cluster_ip.as_deref(), Some("None"));
    }
}

mod secret_tests {
    use super::*;

    #[test]
    fn test_auth_secret_has_every_builtin_user() {
        let es = create_test_database("quick-es", "demo", 1);
        let auth = secret::generate_auth_secret(&es);

        assert_eq!(auth.name_any(), "quick-es-auth");
        let data = auth.string_data.unwrap();
        for user in secret::DEFAULT_USERS {
            let upper = user.to_uppercase();
            assert_eq!(data.get(&format!("{upper}_USERNAME")), Some(&user.to_string()));
            assert!(!data[&format!("{upper}_PASSWORD")].is_empty());
        }
    }

    #[test]
    fn test_named_secrets_are_respected() {
        let es = ElasticsearchBuilder::new("quick-es", "demo")
            .with_auth_secret("creds")
            .with_config_secret("custom-config")
            .build();
        assert_eq!(secret::auth_secret_name(&es), "creds");
        assert_eq!(secret::config_secret_name(&es), "custom-config");
    }
}

mod monitor_tests {
    use super::*;

    #[test]
    fn test_service_monitor_only_for_operator_agent() {
        let builtin = ElasticsearchBuilder::new("quick-es", "demo")
            .with_monitor(MonitorAgent::PrometheusBuiltin)
            .build();
        assert!(monitor::generate_service_monitor(&builtin).is_none());

        let operator = ElasticsearchBuilder::new("quick-es", "demo")
            .with_monitor(MonitorAgent::PrometheusOperator)
            .build();
        let (namespace, obj) = monitor::generate_service_monitor(&operator).unwrap();
        assert_eq!(namespace, "monitoring");
        assert_eq!(obj.metadata.name.as_deref(), Some("kubedb-demo-quick-es"));
        let labels = obj.metadata.labels.unwrap();
        assert_eq!(labels.get("k8s-app"), Some(&"prometheus".to_string()));
        assert_eq!(obj.data["spec"]["endpoints"][0]["interval"], "10s");
    }
}

mod job_tests {
    use super::*;

    #[test]
    fn test_restore_job_names_and_labels() {
        let es = ElasticsearchBuilder::new("quick-es", "demo")
            .with_snapshot_source("snap-1")
            .build();
        let snapshot = create_test_snapshot("snap-1", "demo", "origin-es");
        let job = jobs::generate_restore_job(&es, &snapshot, "kubedb/elasticsearch-tools:6.3", None);

        assert_eq!(job.name_any(), "quick-es-restore");
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(jobs::LABEL_JOB_TYPE), Some(&"restore".to_string()));
        assert_eq!(jobs::job_outcome(&job), jobs::JobOutcome::Running);
    }

    #[test]
    fn test_backup_job_owned_by_snapshot() {
        let es = create_test_database("quick-es", "demo", 1);
        let snapshot = create_test_snapshot("snap-1", "demo", "quick-es");
        let job = jobs::generate_backup_job(&es, &snapshot, "kubedb/elasticsearch-tools:6.3", None);

        assert_eq!(job.name_any(), "snap-1-backup");
        let owner = &job.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Snapshot");
        assert_eq!(owner.name, "snap-1");
    }
}
