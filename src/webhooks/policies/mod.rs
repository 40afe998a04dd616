//! Admission policies for Elasticsearch
//!
//! Each policy module exports a `validate_*` function over a
//! [`ValidationContext`]. Policies are pure: everything they need from the
//! cluster is gathered up front into [`ValidationFacts`].

pub mod backup;
pub mod immutability;
pub mod monitor;
pub mod resources;
pub mod storage;
pub mod termination;
pub mod tls;
pub mod version;

pub use backup::validate_backup;
pub use immutability::validate_immutability;
pub use monitor::validate_monitor;
pub use resources::validate_memory;
pub use storage::validate_storage;
pub use termination::validate_delete;
pub use tls::validate_tls;
pub use version::validate_version;

use crate::crd::{Elasticsearch, ElasticsearchVersion};

/// Result of a policy validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// Cluster state a validation depends on
#[derive(Debug, Clone, Default)]
pub struct ValidationFacts {
    /// Catalog entry named by `spec.version`, if it exists
    pub version: Option<ElasticsearchVersion>,
    /// Storage classes referenced by the spec that do not exist
    pub unknown_storage_classes: Vec<String>,
}

/// Context for validation including old object for UPDATE operations
pub struct ValidationContext<'a> {
    pub es: &'a Elasticsearch,
    pub old: Option<&'a Elasticsearch>,
    pub facts: &'a ValidationFacts,
    /// Lowest accepted memory request, as a quantity
    pub min_memory: &'a str,
}

impl<'a> ValidationContext<'a> {
    pub fn new(
        es: &'a Elasticsearch,
        old: Option<&'a Elasticsearch>,
        facts: &'a ValidationFacts,
        min_memory: &'a str,
    ) -> Self {
        Self {
            es,
            old,
            facts,
            min_memory,
        }
    }

    pub fn is_create(&self) -> bool {
        self.old.is_none()
    }

    /// True for updates that leave the spec untouched
    pub fn is_status_only(&self) -> bool {
        self.old.is_some_and(|old| old.spec == self.es.spec)
    }
}

/// Run all validation policies and return the first failure
pub fn validate_all(ctx: &ValidationContext) -> ValidationResult {
    if ctx.is_status_only() {
        return ValidationResult::allowed();
    }

    let policies: [fn(&ValidationContext) -> ValidationResult; 7] = [
        validate_version,
        validate_storage,
        validate_memory,
        validate_tls,
        validate_monitor,
        validate_backup,
        validate_immutability,
    ];

    for policy in policies {
        let result = policy(ctx);
        if !result.allowed {
            return result;
        }
    }

    ValidationResult::allowed()
}
