//! Error types for the Elasticsearch controllers

use std::time::Duration;

use thiserror::Error;

#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("elasticsearch spec mismatches with OriginSpec in DormantDatabases. Diff: {0}")]
    SpecMismatch(String),

    #[error("Object store error: {0}")]
    StorageError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Invalid schedule: {0}")]
    ScheduleError(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(api_err)) => {
                // 4xx other than Conflict and TooManyRequests will not fix themselves
                let code = api_err.code;
                if (400..500).contains(&code) {
                    return code == 409 || code == 429;
                }
                true
            }
            Error::KubeError(_) => true,
            Error::TransientError(_) => true,
            Error::NotFound(_) => true,
            Error::FinalizerError(_) => true,
            Error::StorageError(_) => true,
            Error::Cancelled(_) => true,
            Error::PermanentError(_) => false,
            Error::InvalidConfig(_) => false,
            Error::ValidationError(_) => false,
            Error::SpecMismatch(_) => false,
            Error::SerializationError(_) => false,
            Error::YamlError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::CertificateError(_) => false,
            Error::ScheduleError(_) => false,
        }
    }

    /// Errors caused by the user's spec; reported as events and not retried
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::ValidationError(_)
                | Error::SpecMismatch(_)
                | Error::InvalidConfig(_)
                | Error::ScheduleError(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;

        let delay = (base + jitter).max(0.0).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay)
    }

    /// Non-retryable errors wait the maximum delay for manual intervention
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
