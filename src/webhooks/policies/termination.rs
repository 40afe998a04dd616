//! Delete admission

use super::ValidationResult;
use crate::crd::{Elasticsearch, TerminationPolicy};

/// Gate a DELETE on the stored object's termination policy
///
/// A delete of an object that no longer exists is allowed.
pub fn validate_delete(existing: Option<&Elasticsearch>) -> ValidationResult {
    match existing {
        Some(es) if es.spec.termination_policy == TerminationPolicy::DoNotTerminate => {
            ValidationResult::denied(
                "DoNotTerminate",
                &format!(
                    "elasticsearch \"{}\" can't be deleted. To delete, change spec.terminationPolicy",
                    es.metadata.name.as_deref().unwrap_or_default()
                ),
            )
        }
        _ => ValidationResult::allowed(),
    }
}
