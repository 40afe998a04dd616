//! Scheduled snapshots
//!
//! One entry per database, keyed `<name>@<namespace>`. Each entry runs on its
//! own tokio task and creates a `Snapshot` at every tick unless a snapshot of
//! the same database is still running.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{ListParams, PostParams};
use kube::runtime::events::EventType;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::events::{EventPublisher, actions, reasons};
use crate::crd::{BackupScheduleSpec, Snapshot, SnapshotPhase, SnapshotSpec, SnapshotStorageSpec};
use crate::health::{FireOutcome, HealthState};
use crate::resources::common::{LABEL_SNAPSHOT_STATUS, database_selector, selector_string};

/// Identity of a schedule entry
pub fn entry_key(name: &str, namespace: &str) -> String {
    format!("{name}@{namespace}")
}

/// `<database>-YYYYMMDD-HHMMSS` in UTC
pub fn snapshot_name(database: &str, at: DateTime<Utc>) -> String {
    format!("{database}-{}", at.format("%Y%m%d-%H%M%S"))
}

/// Parsed cron expression
#[derive(Clone, Debug)]
pub enum Schedule {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                now.checked_add_signed(step)
            }
            Schedule::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}

impl FromStr for Schedule {
    type Err = Error;

    /// Accepts 5-field cron, 6/7-field cron with seconds, `@every <duration>`
    /// and the `@hourly`-style descriptors
    fn from_str(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if let Some(every) = expression.strip_prefix("@every") {
            let interval = parse_duration(every.trim())?;
            if interval.is_zero() {
                return Err(Error::ScheduleError(format!(
                    "{expression:?}: interval must be positive"
                )));
            }
            return Ok(Schedule::Every(interval));
        }

        let normalized = match expression {
            "@midnight" => "@daily".to_string(),
            e if e.starts_with('@') => e.to_string(),
            e if e.split_whitespace().count() == 5 => format!("0 {e}"),
            e => e.to_string(),
        };
        cron::Schedule::from_str(&normalized)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| Error::ScheduleError(format!("{expression:?}: {e}")))
    }
}

/// Parse durations such as `90s`, `1m`, `1h30m` or `250ms`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::ScheduleError(format!("invalid duration {input:?}"));
    if input.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(invalid()),
        };
        let step = Duration::try_from_secs_f64(seconds).map_err(|_| invalid())?;
        total = total.checked_add(step).ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// API calls a fire needs
#[async_trait]
pub trait SnapshotClient: Send + Sync {
    /// Names of snapshots of `database` currently labelled Running
    async fn running_snapshots(&self, namespace: &str, database: &str) -> Result<Vec<String>>;

    async fn create_snapshot(&self, namespace: &str, snapshot: &Snapshot) -> Result<()>;
}

pub struct KubeSnapshotClient {
    client: Client,
}

impl KubeSnapshotClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SnapshotClient for KubeSnapshotClient {
    async fn running_snapshots(&self, namespace: &str, database: &str) -> Result<Vec<String>> {
        let api: Api<Snapshot> = Api::namespaced(self.client.clone(), namespace);
        let mut labels = database_selector(database);
        labels.insert(
            LABEL_SNAPSHOT_STATUS.to_string(),
            SnapshotPhase::Running.to_string(),
        );
        let list = api
            .list(&ListParams::default().labels(&selector_string(&labels)))
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect())
    }

    async fn create_snapshot(&self, namespace: &str, snapshot: &Snapshot) -> Result<()> {
        let api: Api<Snapshot> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), snapshot).await?;
        Ok(())
    }
}

/// What a fire needs to know about its database
#[derive(Clone, Debug)]
pub struct FireTarget {
    pub name: String,
    pub namespace: String,
    pub storage: SnapshotStorageSpec,
    pub object_ref: ObjectReference,
}

/// Snapshot a fire at `at` creates for `target`
pub fn scheduled_snapshot(target: &FireTarget, at: DateTime<Utc>) -> Snapshot {
    let mut snapshot = Snapshot::new(
        &snapshot_name(&target.name, at),
        SnapshotSpec {
            database_name: target.name.clone(),
            storage: target.storage.clone(),
            pod_volume_claim_spec: None,
        },
    );
    snapshot.metadata.namespace = Some(target.namespace.clone());
    snapshot.metadata.labels = Some(database_selector(&target.name));
    snapshot
}

/// One fire: skip while a snapshot is running, otherwise create one
pub async fn fire(
    client: &dyn SnapshotClient,
    events: &dyn EventPublisher,
    target: &FireTarget,
    at: DateTime<Utc>,
) -> FireOutcome {
    let running = match client
        .running_snapshots(&target.namespace, &target.name)
        .await
    {
        Ok(running) => running,
        Err(e) => {
            events
                .publish(
                    &target.object_ref,
                    EventType::Warning,
                    reasons::FAILED_TO_LIST,
                    actions::BACKUP,
                    Some(format!("Failed to list Snapshots. Reason: {e}")),
                )
                .await;
            warn!(database = %target.name, error = %e, "failed to list snapshots");
            return FireOutcome::Failed;
        }
    };

    if !running.is_empty() {
        events
            .publish(
                &target.object_ref,
                EventType::Normal,
                reasons::IGNORED_SNAPSHOT,
                actions::BACKUP,
                Some("Skipping scheduled Backup. One is still active.".to_string()),
            )
            .await;
        debug!(database = %target.name, running = ?running, "skipping scheduled snapshot");
        return FireOutcome::Skipped;
    }

    let snapshot = scheduled_snapshot(target, at);
    match client.create_snapshot(&target.namespace, &snapshot).await {
        Ok(()) => {
            info!(
                database = %target.name,
                snapshot = ?snapshot.metadata.name,
                "created scheduled snapshot"
            );
            FireOutcome::Created
        }
        Err(e) => {
            events
                .publish(
                    &target.object_ref,
                    EventType::Warning,
                    reasons::FAILED_TO_CREATE,
                    actions::BACKUP,
                    Some(format!("Failed to create Snapshot. Reason: {e}")),
                )
                .await;
            error!(database = %target.name, error = %e, "failed to create snapshot");
            FireOutcome::Failed
        }
    }
}

struct CronEntry {
    expression: String,
    storage: SnapshotStorageSpec,
    handle: CancellationToken,
}

/// Process-wide schedule registry
pub struct CronEngine {
    entries: DashMap<String, CronEntry>,
    client: Arc<dyn SnapshotClient>,
    events: Arc<dyn EventPublisher>,
    health_state: Option<Arc<HealthState>>,
    root: CancellationToken,
}

impl CronEngine {
    pub fn new(
        client: Arc<dyn SnapshotClient>,
        events: Arc<dyn EventPublisher>,
        health_state: Option<Arc<HealthState>>,
        root: CancellationToken,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            client,
            events,
            health_state,
            root,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str, namespace: &str) -> bool {
        self.entries.contains_key(&entry_key(name, namespace))
    }

    /// Register or replace the schedule of a database
    ///
    /// Re-registering an unchanged expression and storage keeps the running
    /// entry, so repeated reconciles do not reset its timer.
    pub fn schedule(
        &self,
        name: &str,
        namespace: &str,
        object_ref: ObjectReference,
        spec: &BackupScheduleSpec,
    ) -> Result<()> {
        let key = entry_key(name, namespace);
        if let Some(existing) = self.entries.get(&key) {
            if existing.expression == spec.cron_expression && existing.storage == spec.storage {
                return Ok(());
            }
        }

        let schedule: Schedule = spec.cron_expression.parse()?;
        let handle = self.root.child_token();
        let target = FireTarget {
            name: name.to_string(),
            namespace: namespace.to_string(),
            storage: spec.storage.clone(),
            object_ref,
        };

        let previous = self.entries.insert(
            key.clone(),
            CronEntry {
                expression: spec.cron_expression.clone(),
                storage: spec.storage.clone(),
                handle: handle.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.handle.cancel();
        }

        tokio::spawn(run_entry(
            key.clone(),
            schedule,
            target,
            self.client.clone(),
            self.events.clone(),
            self.health_state.clone(),
            handle,
        ));
        self.report();
        info!(entry = %key, expression = %spec.cron_expression, "scheduled backups");
        Ok(())
    }

    /// Remove the entry of a database, if any
    pub fn stop(&self, name: &str, namespace: &str) {
        if let Some((key, entry)) = self.entries.remove(&entry_key(name, namespace)) {
            entry.handle.cancel();
            self.report();
            info!(entry = %key, "stopped scheduled backups");
        }
    }

    /// Cancel every entry
    pub fn shutdown(&self) {
        for entry in self.entries.iter() {
            entry.handle.cancel();
        }
        self.entries.clear();
        self.report();
    }

    fn report(&self) {
        if let Some(state) = &self.health_state {
            state.metrics.set_cron_entries(self.entries.len() as i64);
        }
    }
}

async fn run_entry(
    key: String,
    schedule: Schedule,
    target: FireTarget,
    client: Arc<dyn SnapshotClient>,
    events: Arc<dyn EventPublisher>,
    health_state: Option<Arc<HealthState>>,
    handle: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            debug!(entry = %key, "schedule has no further fire times");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = handle.cancelled() => {
                debug!(entry = %key, "cron entry cancelled");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let outcome = fire(client.as_ref(), events.as_ref(), &target, Utc::now()).await;
        if let Some(state) = &health_state {
            state.metrics.record_fire(outcome);
        }
    }
}
