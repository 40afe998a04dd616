//! Monitor policy
//!
//! The coreos-operator agent creates a ServiceMonitor, which needs a
//! namespace to live in and labels for Prometheus to select it by.

use super::{ValidationContext, ValidationResult};
use crate::crd::MonitorAgent;

pub fn validate_monitor(ctx: &ValidationContext) -> ValidationResult {
    let Some(monitor) = &ctx.es.spec.monitor else {
        return ValidationResult::allowed();
    };

    if let Some(port) = monitor.prometheus.as_ref().map(|p| p.port)
        && !(0..=65535).contains(&port)
    {
        return ValidationResult::denied(
            "InvalidMonitor",
            &format!("monitor.prometheus.port {port} is out of range"),
        );
    }

    if monitor.agent == MonitorAgent::PrometheusOperator {
        let prometheus = monitor.prometheus.as_ref();
        let has_namespace = prometheus
            .and_then(|p| p.namespace.as_deref())
            .is_some_and(|ns| !ns.is_empty());
        let has_labels = prometheus.is_some_and(|p| !p.labels.is_empty());
        if !has_namespace || !has_labels {
            return ValidationResult::denied(
                "InvalidMonitor",
                &format!(
                    "monitor.prometheus.namespace and monitor.prometheus.labels are required for agent {}",
                    monitor.agent
                ),
            );
        }
    }

    ValidationResult::allowed()
}
