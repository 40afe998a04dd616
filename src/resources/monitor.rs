//! Prometheus Operator ServiceMonitor for the stats service
//!
//! ServiceMonitor is a CRD, so it is built as a `DynamicObject`. It lives in
//! the monitoring namespace and therefore carries no owner reference.

use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};
use kube::core::ObjectMeta;
use serde_json::json;

use crate::crd::{Elasticsearch, MonitorAgent};
use crate::resources::common::offshoot_labels;
use crate::resources::service::EXPORTER_PORT_NAME;

/// Exporter port used when the monitor leaves it at 0
pub const DEFAULT_EXPORTER_PORT: i32 = 56790;

const MONITORING_GROUP: &str = "monitoring.coreos.com";
const MONITORING_VERSION: &str = "v1";

pub fn service_monitor_resource() -> ApiResource {
    ApiResource {
        group: MONITORING_GROUP.to_string(),
        version: MONITORING_VERSION.to_string(),
        kind: "ServiceMonitor".to_string(),
        api_version: format!("{MONITORING_GROUP}/{MONITORING_VERSION}"),
        plural: "servicemonitors".to_string(),
    }
}

/// Path the exporter serves this database's metrics on
pub fn metrics_path(es: &Elasticsearch) -> String {
    format!(
        "/kubedb.com/v1alpha1/namespaces/{}/elasticsearches/{}/metrics",
        es.namespace().unwrap_or_default(),
        es.name_any()
    )
}

pub fn service_monitor_name(es: &Elasticsearch) -> String {
    format!(
        "kubedb-{}-{}",
        es.namespace().unwrap_or_default(),
        es.name_any()
    )
}

/// ServiceMonitor selecting the stats service, if the coreos agent is used
///
/// Returns the object together with the namespace it must be created in.
pub fn generate_service_monitor(es: &Elasticsearch) -> Option<(String, DynamicObject)> {
    let monitor = es.spec.monitor.as_ref()?;
    if monitor.agent != MonitorAgent::PrometheusOperator {
        return None;
    }
    let prometheus = monitor.prometheus.as_ref()?;
    let namespace = prometheus.namespace.clone()?;

    let name = service_monitor_name(es);
    let mut labels = prometheus.labels.clone();
    labels.extend(offshoot_labels(&es.name_any()));

    let mut selector = offshoot_labels(&es.name_any());
    selector.insert("kubedb.com/role".to_string(), "stats".to_string());

    let mut endpoint = json!({
        "port": EXPORTER_PORT_NAME,
        "path": metrics_path(es),
    });
    if let Some(interval) = &prometheus.interval {
        endpoint["interval"] = json!(interval);
    }

    let mut obj = DynamicObject::new(&name, &service_monitor_resource());
    obj.metadata = ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.clone()),
        labels: Some(labels),
        ..Default::default()
    };
    obj.data = json!({
        "spec": {
            "namespaceSelector": {"matchNames": [es.namespace().unwrap_or_default()]},
            "selector": {"matchLabels": selector},
            "endpoints": [endpoint]
        }
    });

    Some((namespace, obj))
}
