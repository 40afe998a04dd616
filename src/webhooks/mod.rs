//! Admission webhooks for Elasticsearch
//!
//! The mutating webhook applies defaults (see [`mutator`]); the validating
//! webhook enforces the policies in [`policies`] and gates deletes on the
//! termination policy.

pub mod mutator;
pub mod policies;
mod server;

pub use mutator::{mutate, set_defaults};
pub use policies::{ValidationContext, ValidationFacts, ValidationResult};
pub use server::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, AdmissionReviewResponse,
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};
