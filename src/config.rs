//! Operator options read from the environment

use std::time::Duration;

use envconfig::Envconfig;

use crate::crd::ElasticsearchVersion;

#[derive(Envconfig, Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    #[envconfig(from = "DOCKER_REGISTRY", default = "kubedb")]
    pub docker_registry: String,

    /// Tag of the operator image, also used for the exporter sidecar
    #[envconfig(from = "EXPORTER_TAG", default = "0.9.0")]
    pub exporter_tag: String,

    /// Fallback tag of the dump/restore tools image
    #[envconfig(from = "TOOLS_TAG", default = "5.6.4")]
    pub tools_tag: String,

    #[envconfig(from = "GOVERNING_SERVICE", default = "kubedb")]
    pub governing_service: String,

    #[envconfig(from = "ENABLE_RBAC", default = "true")]
    pub enable_rbac: bool,

    #[envconfig(from = "WORKER_COUNT", default = "2")]
    pub worker_count: u16,

    /// Lowest memory request the validator accepts
    #[envconfig(from = "MIN_MEMORY_REQUEST", default = "256Mi")]
    pub min_memory_request: String,

    #[envconfig(from = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    #[envconfig(from = "POD_READY_TIMEOUT_SECS", default = "300")]
    pub pod_ready_timeout_secs: u64,

    #[envconfig(from = "POD_POLL_INTERVAL_SECS", default = "10")]
    pub pod_poll_interval_secs: u64,

    #[envconfig(from = "FORMATION_WAIT_SECS", default = "30")]
    pub formation_wait_secs: u64,

    #[envconfig(from = "RESTORE_TIMEOUT_SECS", default = "1800")]
    pub restore_timeout_secs: u64,

    #[envconfig(from = "RESTORE_POLL_INTERVAL_SECS", default = "60")]
    pub restore_poll_interval_secs: u64,

    #[envconfig(from = "HEALTH_ADDR", default = "0.0.0.0:8080")]
    pub health_addr: String,

    #[envconfig(from = "WEBHOOK_PORT", default = "8443")]
    pub webhook_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            docker_registry: "kubedb".to_string(),
            exporter_tag: "0.9.0".to_string(),
            tools_tag: "5.6.4".to_string(),
            governing_service: "kubedb".to_string(),
            enable_rbac: true,
            worker_count: 2,
            min_memory_request: "256Mi".to_string(),
            watch_namespace: None,
            pod_ready_timeout_secs: 300,
            pod_poll_interval_secs: 10,
            formation_wait_secs: 30,
            restore_timeout_secs: 1800,
            restore_poll_interval_secs: 60,
            health_addr: "0.0.0.0:8080".to_string(),
            webhook_port: 8443,
        }
    }
}

impl OperatorConfig {
    pub fn pod_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_ready_timeout_secs)
    }

    pub fn pod_poll_interval(&self) -> Duration {
        Duration::from_secs(self.pod_poll_interval_secs)
    }

    pub fn formation_wait(&self) -> Duration {
        Duration::from_secs(self.formation_wait_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }

    pub fn restore_poll_interval(&self) -> Duration {
        Duration::from_secs(self.restore_poll_interval_secs)
    }

    /// Resolve the images for a version, preferring the catalog entry
    pub fn images(&self, version: &str, record: Option<&ElasticsearchVersion>) -> Images {
        let database = record
            .map(|r| r.spec.db.image.clone())
            .unwrap_or_else(|| format!("{}/elasticsearch:{}", self.docker_registry, version));
        let exporter = record
            .and_then(|r| r.spec.exporter.as_ref())
            .map(|i| i.image.clone())
            .unwrap_or_else(|| format!("{}/operator:{}", self.docker_registry, self.exporter_tag));
        let tools = record
            .and_then(|r| r.spec.tools.as_ref())
            .map(|i| i.image.clone())
            .unwrap_or_else(|| {
                format!(
                    "{}/elasticsearch-tools:{}",
                    self.docker_registry, self.tools_tag
                )
            });
        Images {
            database,
            exporter,
            tools,
        }
    }
}

/// Container images used for one database
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Images {
    pub database: String,
    pub exporter: String,
    pub tools: String,
}
