//! Test fixtures and builders for Elasticsearch and its companion resources
//!
//! ```rust,ignore
//! let es = create_test_database("quick-es", "demo", 3);
//!
//! let es = ElasticsearchBuilder::topology("quick-es", "demo")
//!     .with_monitor(MonitorAgent::PrometheusBuiltin)
//!     .with_backup_schedule("@every 6h", "store", "bucket")
//!     .build();
//! ```

use std::collections::BTreeMap;

use elasticsearch_operator::crd::{
    BackupScheduleSpec, CertificateAlias, CertificateSpec, DatabasePhase, DormantDatabase,
    Elasticsearch, ElasticsearchClusterTopology, ElasticsearchNode, ElasticsearchSpec,
    ElasticsearchStatus, ElasticsearchVersion, ElasticsearchVersionSpec, ImageRef, InitSpec,
    MonitorAgent, MonitorSpec, PrometheusSpec, ResourceList, ResourceRequirements,
    SecretReference, Snapshot, SnapshotSourceSpec, SnapshotSpec, SnapshotStorageSpec, StorageSpec,
    StorageType, TerminationPolicy, TlsConfig,
};
use kube::core::ObjectMeta;

// =============================================================================
// Convenience functions
// =============================================================================

/// Combined-mode database with durable 1Gi storage and a 512Mi request
pub fn create_test_database(name: &str, namespace: &str, replicas: i32) -> Elasticsearch {
    ElasticsearchBuilder::new(name, namespace)
        .with_replicas(replicas)
        .build()
}

/// Catalog entry for `version` with default images
pub fn create_test_version(version: &str) -> ElasticsearchVersion {
    ElasticsearchVersion::new(
        version,
        ElasticsearchVersionSpec {
            version: version.to_string(),
            db: ImageRef {
                image: format!("kubedb/elasticsearch:{version}"),
            },
            exporter: None,
            tools: None,
            auth_plugin: Default::default(),
            deprecated: false,
        },
    )
}

pub fn storage_location(secret: &str, bucket: &str) -> SnapshotStorageSpec {
    SnapshotStorageSpec {
        storage_secret_name: Some(secret.to_string()),
        bucket_name: Some(bucket.to_string()),
        prefix: None,
    }
}

/// Snapshot of `database`, stored in `bucket`
pub fn create_test_snapshot(name: &str, namespace: &str, database: &str) -> Snapshot {
    let mut snapshot = Snapshot::new(
        name,
        SnapshotSpec {
            database_name: database.to_string(),
            storage: storage_location("store", "bucket"),
            pod_volume_claim_spec: None,
        },
    );
    snapshot.metadata.namespace = Some(namespace.to_string());
    snapshot.metadata.uid = Some(format!("{name}-uid"));
    snapshot
}

// =============================================================================
// Elasticsearch builder
// =============================================================================

/// Builder for Elasticsearch test fixtures
pub struct ElasticsearchBuilder {
    metadata: ObjectMeta,
    spec: ElasticsearchSpec,
    status: Option<ElasticsearchStatus>,
}

#[allow(dead_code)]
impl ElasticsearchBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        let spec: ElasticsearchSpec =
            serde_json::from_value(serde_json::json!({ "version": "6.3" })).unwrap();
        let mut builder = Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(format!("{name}-uid")),
                generation: Some(1),
                ..Default::default()
            },
            spec,
            status: None,
        };
        builder.spec.replicas = Some(1);
        builder.spec.storage = Some(storage("1Gi"));
        builder.spec.pod_template.spec.resources = memory_request("512Mi");
        builder
    }

    /// Dedicated client, master and data groups named with role prefixes
    pub fn topology(name: &str, namespace: &str) -> Self {
        let mut builder = Self::new(name, namespace);
        let node = |prefix: &str, replicas: i32| ElasticsearchNode {
            replicas: Some(replicas),
            prefix: Some(prefix.to_string()),
            storage: Some(storage("1Gi")),
            resources: memory_request("512Mi"),
        };
        builder.spec.replicas = None;
        builder.spec.storage = None;
        builder.spec.topology = Some(ElasticsearchClusterTopology {
            client: node("client", 1),
            master: node("master", 3),
            data: node("data", 2),
        });
        builder
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.spec.version = version.to_string();
        self
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.spec.replicas = Some(replicas);
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.metadata.generation = Some(generation);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.spec.storage_type = StorageType::Ephemeral;
        self.spec.storage = None;
        self
    }

    pub fn with_memory_request(mut self, memory: &str) -> Self {
        self.spec.pod_template.spec.resources = memory_request(memory);
        self
    }

    pub fn without_memory_request(mut self) -> Self {
        self.spec.pod_template.spec.resources = ResourceRequirements::default();
        self
    }

    pub fn with_ssl(mut self) -> Self {
        self.spec.enable_ssl = true;
        self.spec.tls = Some(TlsConfig {
            certificates: [CertificateAlias::Transport, CertificateAlias::Admin, CertificateAlias::Http]
                .into_iter()
                .map(|alias| CertificateSpec {
                    alias,
                    secret_name: None,
                })
                .collect(),
        });
        self
    }

    pub fn without_security(mut self) -> Self {
        self.spec.disable_security = true;
        self
    }

    pub fn with_auth_secret(mut self, name: &str) -> Self {
        self.spec.auth_secret = Some(SecretReference::new(name));
        self
    }

    pub fn with_config_secret(mut self, name: &str) -> Self {
        self.spec.config_secret = Some(SecretReference::new(name));
        self
    }

    pub fn with_monitor(mut self, agent: MonitorAgent) -> Self {
        let prometheus = match agent {
            MonitorAgent::PrometheusOperator => Some(PrometheusSpec {
                port: 0,
                namespace: Some("monitoring".to_string()),
                labels: BTreeMap::from([("k8s-app".to_string(), "prometheus".to_string())]),
                interval: Some("10s".to_string()),
            }),
            MonitorAgent::PrometheusBuiltin => None,
        };
        self.spec.monitor = Some(MonitorSpec { agent, prometheus });
        self
    }

    pub fn with_backup_schedule(mut self, expression: &str, secret: &str, bucket: &str) -> Self {
        self.spec.backup_schedule = Some(BackupScheduleSpec {
            cron_expression: expression.to_string(),
            storage: storage_location(secret, bucket),
        });
        self
    }

    pub fn with_snapshot_source(mut self, snapshot: &str) -> Self {
        self.spec.init = Some(InitSpec {
            wait_for_initial_restore: true,
            snapshot_source: Some(SnapshotSourceSpec {
                namespace: None,
                name: snapshot.to_string(),
            }),
            initialized: false,
        });
        self
    }

    pub fn with_termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.spec.termination_policy = policy;
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_phase(mut self, phase: DatabasePhase) -> Self {
        self.status = Some(ElasticsearchStatus {
            phase,
            observed_generation: self.metadata.generation,
            creation_time: Some("2024-01-01T00:00:00Z".to_string()),
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> Elasticsearch {
        Elasticsearch {
            metadata: self.metadata,
            spec: self.spec,
            status: self.status,
        }
    }
}

fn storage(size: &str) -> StorageSpec {
    StorageSpec {
        storage_class_name: Some("standard".to_string()),
        access_modes: Vec::new(),
        size: size.to_string(),
    }
}

fn memory_request(memory: &str) -> ResourceRequirements {
    ResourceRequirements {
        limits: None,
        requests: Some(ResourceList {
            cpu: None,
            memory: Some(memory.to_string()),
        }),
    }
}

/// Dormant record of `es` as a Halt termination would write it
pub fn dormant_of(es: &Elasticsearch) -> DormantDatabase {
    elasticsearch_operator::controller::dormant::dormant_for(es).unwrap()
}
