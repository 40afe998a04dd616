use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::common::{
    Condition, PodTemplateSpec, ResourceRequirements, SecretReference, ServiceTemplateSpec,
    SnapshotStorageSpec, StorageSpec,
};

/// Elasticsearch is the Schema for the elasticsearches API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    shortname = "es",
    namespaced,
    derive = "PartialEq",
    status = "ElasticsearchStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    /// Version of Elasticsearch; must name an ElasticsearchVersion
    pub version: String,

    /// Number of nodes in combined mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Dedicated master/data/client node groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<ElasticsearchClusterTopology>,

    #[serde(default)]
    pub storage_type: StorageType,

    /// Volume claim template for combined mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Serve the REST API over HTTPS
    #[serde(default, rename = "enableSSL")]
    pub enable_ssl: bool,

    /// Run without the security plugin
    #[serde(default)]
    pub disable_security: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<SecretReference>,

    /// User supplied elasticsearch.yml and security plugin files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_secret: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_secret: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_schedule: Option<BackupScheduleSpec>,

    #[serde(default)]
    pub pod_template: PodTemplateSpec,

    #[serde(default)]
    pub service_template: ServiceTemplateSpec,

    #[serde(default)]
    pub termination_policy: TerminationPolicy,

    /// Stop reconciling without touching dependents
    #[serde(default)]
    pub paused: bool,

    /// Remove workloads and services while keeping volumes
    #[serde(default)]
    pub halted: bool,

    #[serde(default)]
    pub do_not_pause: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Additional users written to the security plugin's internal user database
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub internal_users: BTreeMap<String, InternalUser>,
}

/// Master, data and client node groups
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchClusterTopology {
    pub master: ElasticsearchNode,
    pub data: ElasticsearchNode,
    pub client: ElasticsearchNode,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Prepended to the database name to form the workload name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum StorageType {
    #[default]
    Durable,
    Ephemeral,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TerminationPolicy {
    /// Reject deletion
    DoNotTerminate,
    /// Keep volumes and a dormant record
    #[default]
    Halt,
    /// Remove dependents and volumes, keep snapshots
    Delete,
    /// Remove everything, including snapshots
    WipeOut,
}

impl std::fmt::Display for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationPolicy::DoNotTerminate => write!(f, "DoNotTerminate"),
            TerminationPolicy::Halt => write!(f, "Halt"),
            TerminationPolicy::Delete => write!(f, "Delete"),
            TerminationPolicy::WipeOut => write!(f, "WipeOut"),
        }
    }
}

/// Initialization source for a new database
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitSpec {
    #[serde(default)]
    pub wait_for_initial_restore: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_source: Option<SnapshotSourceSpec>,

    /// Set once the initial restore finished
    #[serde(default)]
    pub initialized: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSourceSpec {
    /// Defaults to the database namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// Monitoring agent configuration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    pub agent: MonitorAgent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusSpec>,
}

impl MonitorSpec {
    /// Every supported agent scrapes through a Prometheus exporter
    pub fn is_prometheus_family(&self) -> bool {
        matches!(
            self.agent,
            MonitorAgent::PrometheusBuiltin | MonitorAgent::PrometheusOperator
        )
    }

    /// Configured exporter port, if any
    pub fn exporter_port(&self) -> Option<i32> {
        self.prometheus
            .as_ref()
            .map(|p| p.port)
            .filter(|port| *port > 0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum MonitorAgent {
    #[serde(rename = "prometheus.io/builtin")]
    PrometheusBuiltin,
    #[serde(rename = "prometheus.io/coreos-operator")]
    PrometheusOperator,
}

impl std::fmt::Display for MonitorAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorAgent::PrometheusBuiltin => write!(f, "prometheus.io/builtin"),
            MonitorAgent::PrometheusOperator => write!(f, "prometheus.io/coreos-operator"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSpec {
    /// Exporter listening port; 0 selects the default
    #[serde(default)]
    pub port: i32,

    /// Namespace of the ServiceMonitor (coreos-operator agent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Labels the Prometheus server selects ServiceMonitors by
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// Periodic snapshot schedule
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Standard 5-field cron, 6-field cron with seconds, or `@every <duration>`
    pub cron_expression: String,

    #[serde(flatten)]
    pub storage: SnapshotStorageSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub certificates: Vec<CertificateSpec>,
}

impl TlsConfig {
    pub fn certificate(&self, alias: CertificateAlias) -> Option<&CertificateSpec> {
        self.certificates.iter().find(|c| c.alias == alias)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub alias: CertificateAlias,

    /// Secret holding tls.crt/tls.key; defaults to `<name>-<alias>-cert`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateAlias {
    Root,
    Transport,
    Http,
    Admin,
    Archiver,
    MetricsExporter,
}

impl std::fmt::Display for CertificateAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CertificateAlias::Root => "root",
            CertificateAlias::Transport => "transport",
            CertificateAlias::Http => "http",
            CertificateAlias::Admin => "admin",
            CertificateAlias::Archiver => "archiver",
            CertificateAlias::MetricsExporter => "metrics-exporter",
        };
        write!(f, "{s}")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InternalUser {
    #[serde(default)]
    pub reserved: bool,

    #[serde(default)]
    pub hidden: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Status of an Elasticsearch database
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchStatus {
    #[serde(default)]
    pub phase: DatabasePhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When the operator first started creating the database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum DatabasePhase {
    #[default]
    Empty,
    Creating,
    Initializing,
    Running,
    Halted,
    Failed,
}

impl std::fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabasePhase::Empty => write!(f, "Empty"),
            DatabasePhase::Creating => write!(f, "Creating"),
            DatabasePhase::Initializing => write!(f, "Initializing"),
            DatabasePhase::Running => write!(f, "Running"),
            DatabasePhase::Halted => write!(f, "Halted"),
            DatabasePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl Elasticsearch {
    pub fn phase(&self) -> DatabasePhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    pub fn is_topology(&self) -> bool {
        self.spec.topology.is_some()
    }

    pub fn security_enabled(&self) -> bool {
        !self.spec.disable_security
    }

    /// Prometheus-family monitor, if configured
    pub fn prometheus_monitor(&self) -> Option<&MonitorSpec> {
        self.spec
            .monitor
            .as_ref()
            .filter(|m| m.is_prometheus_family())
    }

    /// Names of the secrets the spec points at explicitly
    pub fn referenced_secrets(&self) -> Vec<&str> {
        let spec = &self.spec;
        let mut names: Vec<&str> = [&spec.auth_secret, &spec.config_secret, &spec.certificate_secret]
            .into_iter()
            .flatten()
            .map(|r| r.secret_name.as_str())
            .collect();
        if let Some(tls) = &spec.tls {
            names.extend(tls.certificates.iter().filter_map(|c| c.secret_name.as_deref()));
        }
        names
    }
}
