//! Services in front of Elasticsearch nodes
//!
//! - governing: headless, shared by every database in the namespace
//! - client (`<name>`): REST on 9200, routed to client-role pods
//! - master (`<name>-master`): transport on 9300, used for discovery
//! - stats (`<name>-stats`): exporter port, only with a Prometheus monitor

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{Elasticsearch, MonitorAgent};
use crate::resources::common::{
    LABEL_ROLE_CLIENT, LABEL_ROLE_MASTER, ROLE_SET, database_selector, merged_labels,
    offshoot_labels, owner_reference,
};
use crate::resources::monitor::{DEFAULT_EXPORTER_PORT, metrics_path};

pub const HTTP_PORT: i32 = 9200;
pub const HTTP_PORT_NAME: &str = "http";
pub const TRANSPORT_PORT: i32 = 9300;
pub const TRANSPORT_PORT_NAME: &str = "transport";
pub const EXPORTER_PORT_NAME: &str = "prom-http";

pub fn master_service_name(es: &Elasticsearch) -> String {
    format!("{}-master", es.name_any())
}

pub fn stats_service_name(es: &Elasticsearch) -> String {
    format!("{}-stats", es.name_any())
}

fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::String(name.to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn role_selector(es: &Elasticsearch, role_label: &str) -> BTreeMap<String, String> {
    let mut selector = database_selector(&es.name_any());
    selector.insert(role_label.to_string(), ROLE_SET.to_string());
    selector
}

/// Headless service giving stable DNS to every workload member
pub fn generate_governing_service(name: &str, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "kubedb.com".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Client-facing REST service with `serviceTemplate` overrides applied
pub fn generate_client_service(es: &Elasticsearch) -> Service {
    let template = &es.spec.service_template;
    let overrides = &template.spec;
    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());

    let spec = ServiceSpec {
        selector: Some(role_selector(es, LABEL_ROLE_CLIENT)),
        ports: Some(vec![tcp_port(HTTP_PORT_NAME, HTTP_PORT)]),
        type_: overrides.type_.clone(),
        cluster_ip: overrides.cluster_ip.clone(),
        external_ips: non_empty(&overrides.external_ips),
        external_traffic_policy: overrides.external_traffic_policy.clone(),
        load_balancer_ip: overrides.load_balancer_ip.clone(),
        load_balancer_source_ranges: non_empty(&overrides.load_balancer_source_ranges),
        health_check_node_port: overrides.health_check_node_port,
        ..Default::default()
    };

    Service {
        metadata: ObjectMeta {
            name: Some(es.name_any()),
            namespace: es.namespace(),
            labels: Some(merged_labels(&es.name_any(), &template.metadata.labels)),
            annotations: (!template.metadata.annotations.is_empty())
                .then(|| template.metadata.annotations.clone()),
            owner_references: Some(vec![owner_reference(es)]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// Transport service selecting master-eligible pods
pub fn generate_master_service(es: &Elasticsearch) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(master_service_name(es)),
            namespace: es.namespace(),
            labels: Some(offshoot_labels(&es.name_any())),
            owner_references: Some(vec![owner_reference(es)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(role_selector(es, LABEL_ROLE_MASTER)),
            ports: Some(vec![tcp_port(TRANSPORT_PORT_NAME, TRANSPORT_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Exporter service; `None` unless the monitor is Prometheus-family
pub fn generate_stats_service(es: &Elasticsearch) -> Option<Service> {
    let monitor = es.prometheus_monitor()?;
    let port = monitor.exporter_port().unwrap_or(DEFAULT_EXPORTER_PORT);

    let mut labels = offshoot_labels(&es.name_any());
    labels.insert("kubedb.com/role".to_string(), "stats".to_string());

    let annotations = (monitor.agent == MonitorAgent::PrometheusBuiltin).then(|| {
        BTreeMap::from([
            ("prometheus.io/scrape".to_string(), "true".to_string()),
            ("prometheus.io/port".to_string(), port.to_string()),
            ("prometheus.io/path".to_string(), metrics_path(es)),
        ])
    });

    Some(Service {
        metadata: ObjectMeta {
            name: Some(stats_service_name(es)),
            namespace: es.namespace(),
            labels: Some(labels),
            annotations,
            owner_references: Some(vec![owner_reference(es)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(role_selector(es, LABEL_ROLE_CLIENT)),
            ports: Some(vec![tcp_port(EXPORTER_PORT_NAME, port)]),
            ..Default::default()
        }),
        ..Default::default()
    })
}
