//! Readiness probing of workload replicas and cancellable waits

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::controller::error::{Error, Result};

/// Reads the phase of a single pod
#[async_trait]
pub trait WorkloadProbe: Send + Sync {
    /// `None` when the pod does not exist yet
    async fn pod_phase(&self, namespace: &str, pod: &str) -> Result<Option<String>>;
}

pub struct KubeWorkloadProbe {
    client: Client,
}

impl KubeWorkloadProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadProbe for KubeWorkloadProbe {
    async fn pod_phase(&self, namespace: &str, pod: &str) -> Result<Option<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(pod)
            .await?
            .and_then(|p| p.status)
            .and_then(|s| s.phase))
    }
}

/// Sleep for `duration` unless `cancel` fires first
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled("shutdown requested".to_string())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run `check` every `interval` until it yields a value or `timeout` passes
///
/// Returns `Ok(None)` on timeout. The first check runs immediately.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep_or_cancel(interval.min(deadline - now), cancel).await?;
    }
}

/// Wait for the first replica of a StatefulSet to reach `Running`
pub async fn wait_for_first_pod(
    probe: &dyn WorkloadProbe,
    namespace: &str,
    statefulset: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let pod = format!("{statefulset}-0");
    let running = poll_until(timeout, interval, cancel, || async {
        let phase = probe.pod_phase(namespace, &pod).await?;
        debug!(pod = %pod, phase = ?phase, "probed pod");
        Ok((phase.as_deref() == Some("Running")).then_some(()))
    })
    .await?;

    running.ok_or_else(|| {
        Error::TransientError(format!(
            "pod {namespace}/{pod} is not running after {}s",
            timeout.as_secs()
        ))
    })
}
