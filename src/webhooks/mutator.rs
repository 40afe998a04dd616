//! Defaulting for Elasticsearch objects
//!
//! Applied by the mutating webhook before an object is persisted. The
//! result is returned to the API server as a JSON patch.

use std::collections::BTreeMap;

use crate::controller::error::{Error, Result};
use crate::controller::validation::parse_quantity;
use crate::crd::{
    DormantDatabase, Elasticsearch, ElasticsearchSpec, PrometheusSpec, ResourceList,
    ResourceRequirements,
};
use crate::resources::common::{ANNOTATION_INITIALIZED, KIND, LABEL_DATABASE_KIND};
use crate::resources::monitor::DEFAULT_EXPORTER_PORT;

/// Memory request used when neither a request nor a limit is given
pub const DEFAULT_MEMORY_REQUEST: &str = "1Gi";

fn positive(quantity: Option<&str>) -> Option<&str> {
    quantity.filter(|q| parse_quantity(q).is_ok_and(|v| v > 0.0))
}

/// Default the memory request from the limit, else to [`DEFAULT_MEMORY_REQUEST`]
fn default_memory(resources: &mut ResourceRequirements) {
    if positive(resources.memory_request()).is_some() {
        return;
    }
    let memory = positive(resources.memory_limit())
        .unwrap_or(DEFAULT_MEMORY_REQUEST)
        .to_string();
    resources
        .requests
        .get_or_insert_with(ResourceList::default)
        .memory = Some(memory);
}

fn default_monitor_port(spec: &mut ElasticsearchSpec) {
    let Some(monitor) = spec.monitor.as_mut().filter(|m| m.is_prometheus_family()) else {
        return;
    };
    let prometheus = monitor.prometheus.get_or_insert_with(PrometheusSpec::default);
    if prometheus.port == 0 {
        prometheus.port = DEFAULT_EXPORTER_PORT;
    }
}

/// Carry unset fields over from a dormant record and require the rest to match
fn apply_dormant(es: &mut Elasticsearch, dormant: &DormantDatabase) -> Result<()> {
    let name = es.metadata.name.clone().unwrap_or_default();
    let dormant_name = dormant.metadata.name.clone().unwrap_or_default();
    let kind = dormant
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_DATABASE_KIND));
    if kind.map(String::as_str) != Some(KIND) {
        return Err(Error::ValidationError(format!(
            "invalid Elasticsearch: \"{name}\". Exists DormantDatabase \"{dormant_name}\" of different Kind"
        )));
    }

    let mut origin = dormant.origin_elasticsearch().cloned().ok_or_else(|| {
        Error::InvalidConfig(format!("DormantDatabase {dormant_name} has no origin spec"))
    })?;
    let spec = &mut es.spec;

    if spec.auth_secret.is_none() {
        spec.auth_secret = origin.auth_secret.clone();
    }
    if spec.certificate_secret.is_none() {
        spec.certificate_secret = origin.certificate_secret.clone();
    }
    if spec.monitor.is_none() {
        spec.monitor = origin.monitor.clone();
    } else {
        origin.monitor = spec.monitor.clone();
    }
    if spec.backup_schedule.is_none() {
        spec.backup_schedule = origin.backup_schedule.clone();
    } else {
        origin.backup_schedule = spec.backup_schedule.clone();
    }
    origin.do_not_pause = spec.do_not_pause;
    // frozen specs never carry init
    origin.init = spec.init.clone();

    if origin != *spec {
        return Err(Error::SpecMismatch(spec_diff(&origin, spec)?));
    }

    let resumes_restore = spec
        .init
        .as_ref()
        .is_some_and(|i| i.snapshot_source.is_some());
    let marked = es
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_INITIALIZED));
    if resumes_restore && !marked {
        es.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_INITIALIZED.to_string(), String::new());
    }
    Ok(())
}

/// JSON patch from `from` to `to`, rendered for humans
pub fn spec_diff(from: &ElasticsearchSpec, to: &ElasticsearchSpec) -> Result<String> {
    let patch = json_patch::diff(&serde_json::to_value(from)?, &serde_json::to_value(to)?);
    Ok(serde_json::to_string(&patch)?)
}

/// Apply defaults to `es`
///
/// `dormant` is the DormantDatabase with the same name, if one exists.
pub fn set_defaults(es: &mut Elasticsearch, dormant: Option<&DormantDatabase>) -> Result<()> {
    if es.spec.version.is_empty() {
        return Err(Error::ValidationError("spec.version is missing".to_string()));
    }

    match es.spec.topology.as_mut() {
        Some(topology) => {
            for node in [&mut topology.client, &mut topology.master, &mut topology.data] {
                node.replicas.get_or_insert(1);
                default_memory(&mut node.resources);
            }
        }
        None => {
            es.spec.replicas.get_or_insert(1);
            default_memory(&mut es.spec.pod_template.spec.resources);
        }
    }

    if let Some(dormant) = dormant {
        apply_dormant(es, dormant)?;
    }

    default_monitor_port(&mut es.spec);
    Ok(())
}

/// Default a copy of `es` and return the JSON patch that produces it
pub fn mutate(es: &Elasticsearch, dormant: Option<&DormantDatabase>) -> Result<json_patch::Patch> {
    let mut defaulted = es.clone();
    set_defaults(&mut defaulted, dormant)?;
    Ok(json_patch::diff(
        &serde_json::to_value(es)?,
        &serde_json::to_value(&defaulted)?,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crd::{
        BackupScheduleSpec, DormantDatabaseSpec, InitSpec, MonitorAgent, MonitorSpec, Origin,
        OriginMeta, OriginSpec, SecretReference, SnapshotSourceSpec,
    };
    use crate::webhooks::policies::fixtures::sample;

    fn dormant_of(es: &Elasticsearch, kind: &str) -> DormantDatabase {
        let mut origin = es.spec.clone();
        origin.init = None;
        origin.auth_secret = Some(SecretReference::new("foo-auth"));
        origin.certificate_secret = Some(SecretReference::new("foo-cert"));
        let mut dormant = DormantDatabase::new(
            "foo",
            DormantDatabaseSpec {
                origin: Origin {
                    metadata: OriginMeta {
                        name: "foo".to_string(),
                        namespace: "default".to_string(),
                        ..Default::default()
                    },
                    spec: OriginSpec {
                        elasticsearch: Some(origin),
                    },
                },
                wipe_out: false,
                resume: false,
            },
        );
        dormant.metadata.labels = Some(BTreeMap::from([(
            LABEL_DATABASE_KIND.to_string(),
            kind.to_string(),
        )]));
        dormant
    }

    #[test]
    fn test_missing_version_rejected() {
        let mut es = sample();
        es.spec.version.clear();
        assert!(set_defaults(&mut es, None).is_err());
    }

    #[test]
    fn test_combined_defaults() {
        let mut es = sample();
        es.spec.replicas = None;
        es.spec.pod_template.spec.resources = ResourceRequirements::default();
        set_defaults(&mut es, None).unwrap();
        assert_eq!(es.spec.replicas, Some(1));
        assert_eq!(es.spec.pod_template.spec.resources.memory_request(), Some("1Gi"));
    }

    #[test]
    fn test_memory_request_taken_from_limit() {
        let mut es = sample();
        es.spec.topology = Some(Default::default());
        es.spec.topology.as_mut().unwrap().data.resources.limits = Some(ResourceList {
            cpu: None,
            memory: Some("2Gi".to_string()),
        });
        set_defaults(&mut es, None).unwrap();
        let topology = es.spec.topology.unwrap();
        assert_eq!(topology.data.resources.memory_request(), Some("2Gi"));
        assert_eq!(topology.master.resources.memory_request(), Some("1Gi"));
        assert_eq!(topology.client.replicas, Some(1));
    }

    #[test]
    fn test_zero_request_replaced() {
        let mut es = sample();
        es.spec.pod_template.spec.resources.requests = Some(ResourceList {
            cpu: Some("500m".to_string()),
            memory: Some("0".to_string()),
        });
        set_defaults(&mut es, None).unwrap();
        let requests = es.spec.pod_template.spec.resources.requests.unwrap();
        assert_eq!(requests.memory.as_deref(), Some("1Gi"));
        assert_eq!(requests.cpu.as_deref(), Some("500m"));
    }

    #[test]
    fn test_monitor_port_defaulted() {
        let mut es = sample();
        es.spec.monitor = Some(MonitorSpec {
            agent: MonitorAgent::PrometheusBuiltin,
            prometheus: None,
        });
        set_defaults(&mut es, None).unwrap();
        assert_eq!(
            es.spec.monitor.unwrap().exporter_port(),
            Some(DEFAULT_EXPORTER_PORT)
        );
    }

    #[test]
    fn test_defaults_are_idempotent() {
        let mut once = sample();
        once.spec.replicas = None;
        set_defaults(&mut once, None).unwrap();
        let mut twice = once.clone();
        set_defaults(&mut twice, None).unwrap();
        assert_eq!(once, twice);
        assert!(mutate(&once, None).unwrap().0.is_empty());
    }

    #[test]
    fn test_mutate_produces_patch() {
        let mut es = sample();
        es.spec.replicas = None;
        let patch = mutate(&es, None).unwrap();
        let rendered = serde_json::to_string(&patch).unwrap();
        assert!(rendered.contains("/spec/replicas"));
    }

    #[test]
    fn test_dormant_fills_secrets() {
        let mut es = sample();
        es.spec.init = None;
        let dormant = dormant_of(&es, KIND);
        set_defaults(&mut es, Some(&dormant)).unwrap();
        assert_eq!(es.spec.auth_secret, Some(SecretReference::new("foo-auth")));
        assert_eq!(es.spec.certificate_secret, Some(SecretReference::new("foo-cert")));
    }

    #[test]
    fn test_dormant_allows_new_schedule_and_do_not_pause() {
        let mut es = sample();
        es.spec.init = None;
        let dormant = dormant_of(&es, KIND);
        es.spec.do_not_pause = true;
        es.spec.backup_schedule = Some(BackupScheduleSpec {
            cron_expression: "@every 1h".to_string(),
            storage: Default::default(),
        });
        set_defaults(&mut es, Some(&dormant)).unwrap();
        assert!(es.spec.do_not_pause);
    }

    #[test]
    fn test_dormant_of_other_kind_rejected() {
        let mut es = sample();
        let dormant = dormant_of(&es, "MongoDB");
        let err = set_defaults(&mut es, Some(&dormant)).unwrap_err();
        assert!(err.to_string().contains("of different Kind"));
    }

    #[test]
    fn test_dormant_spec_mismatch() {
        let mut es = sample();
        es.spec.init = None;
        let dormant = dormant_of(&es, KIND);
        es.spec.replicas = Some(3);
        let err = set_defaults(&mut es, Some(&dormant)).unwrap_err();
        assert!(matches!(err, Error::SpecMismatch(_)));
        assert!(err.to_string().contains("/replicas"));
    }

    #[test]
    fn test_resumed_restore_marked_initialized() {
        let mut es = sample();
        es.spec.init = Some(InitSpec {
            wait_for_initial_restore: false,
            snapshot_source: Some(SnapshotSourceSpec {
                namespace: None,
                name: "snap".to_string(),
            }),
            initialized: false,
        });
        let dormant = dormant_of(&es, KIND);
        set_defaults(&mut es, Some(&dormant)).unwrap();
        let annotations = es.metadata.annotations.unwrap();
        assert_eq!(annotations.get(ANNOTATION_INITIALIZED).map(String::as_str), Some(""));
    }
}
