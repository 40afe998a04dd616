//! Webhook HTTP server handlers
//!
//! Serves the mutating (`/mutate`) and validating (`/validate`) admission
//! endpoints for Elasticsearch resources.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::mutator::mutate;
use super::policies::{ValidationContext, validate_all, validate_delete};
use crate::controller::validation::{ClusterLookup, gather_facts};
use crate::crd::Elasticsearch;
use crate::resources::common::KIND;

/// Kubernetes AdmissionReview request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

/// AdmissionRequest contains the details of the admission request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub operation: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub sub_resource: Option<String>,
    pub object: Option<serde_json::Value>,
    pub old_object: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// AdmissionReview response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

/// AdmissionResponse contains the result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    /// Base64 JSON patch on the wire
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<ByteString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared state for webhook handlers
pub(crate) struct WebhookState {
    pub lookup: Arc<dyn ClusterLookup>,
    pub min_memory: String,
}

impl WebhookState {
    pub fn new(lookup: Arc<dyn ClusterLookup>, min_memory: impl Into<String>) -> Self {
        Self {
            lookup,
            min_memory: min_memory.into(),
        }
    }
}

/// Create the webhook router
pub(crate) fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_elasticsearch))
        .route("/validate", post(validate_elasticsearch))
        .with_state(state)
}

async fn mutate_elasticsearch(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    match review.request {
        Some(request) => (StatusCode::OK, Json(review_mutation(&state, &request).await)),
        None => (StatusCode::BAD_REQUEST, Json(missing_request())),
    }
}

async fn validate_elasticsearch(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    match review.request {
        Some(request) => (StatusCode::OK, Json(review_validation(&state, &request).await)),
        None => (StatusCode::BAD_REQUEST, Json(missing_request())),
    }
}

fn missing_request() -> AdmissionReviewResponse {
    error!("Admission review missing request");
    create_response("", false, "Missing request in AdmissionReview", None)
}

fn parse_object(value: &serde_json::Value) -> Result<Elasticsearch, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("Failed to parse object: {e}"))
}

fn request_namespace(request: &AdmissionRequest, es: Option<&Elasticsearch>) -> String {
    request
        .namespace
        .clone()
        .or_else(|| es.and_then(|e| e.metadata.namespace.clone()))
        .unwrap_or_else(|| "default".to_string())
}

/// Default the incoming object and answer with a JSON patch
pub(crate) async fn review_mutation(
    state: &WebhookState,
    request: &AdmissionRequest,
) -> AdmissionReviewResponse {
    let uid = request.uid.as_str();
    info!(
        uid = %uid,
        operation = %request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing mutation request"
    );

    if !matches!(request.operation.as_str(), "CREATE" | "UPDATE")
        || request.kind.kind != KIND
        || request.sub_resource.is_some()
    {
        return create_response(uid, true, "", None);
    }

    let Some(object) = &request.object else {
        return create_response(uid, false, "Missing object in request", Some("BadRequest"));
    };
    let es = match parse_object(object) {
        Ok(es) => es,
        Err(message) => return create_response(uid, false, &message, Some("BadRequest")),
    };

    let namespace = request_namespace(request, Some(&es));
    let name = es
        .metadata
        .name
        .clone()
        .or_else(|| request.name.clone())
        .unwrap_or_default();
    let dormant = match state.lookup.dormant(&namespace, &name).await {
        Ok(d) => d,
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to look up DormantDatabase");
            return create_response(uid, false, &e.to_string(), Some("InternalError"));
        }
    };

    match mutate(&es, dormant.as_ref()) {
        Ok(patch) if patch.0.is_empty() => create_response(uid, true, "", None),
        Ok(patch) => match serde_json::to_vec(&patch) {
            Ok(bytes) => {
                let mut response = create_response(uid, true, "", None);
                response.response.patch = Some(ByteString(bytes));
                response.response.patch_type = Some("JSONPatch".to_string());
                response
            }
            Err(e) => create_response(uid, false, &e.to_string(), Some("InternalError")),
        },
        Err(e) => {
            warn!(uid = %uid, error = %e, "Mutation request denied");
            create_response(uid, false, &e.to_string(), Some("Forbidden"))
        }
    }
}

/// Run the admission policies against the incoming object
pub(crate) async fn review_validation(
    state: &WebhookState,
    request: &AdmissionRequest,
) -> AdmissionReviewResponse {
    let uid = request.uid.as_str();
    info!(
        uid = %uid,
        operation = %request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing admission request"
    );

    if request.kind.kind != KIND {
        return create_response(uid, true, "", None);
    }

    if request.operation == "DELETE" {
        let namespace = request_namespace(request, None);
        let name = request.name.clone().unwrap_or_default();
        let existing = match state.lookup.elasticsearch(&namespace, &name).await {
            Ok(es) => es,
            Err(e) => return create_response(uid, false, &e.to_string(), Some("InternalError")),
        };
        let result = validate_delete(existing.as_ref());
        return deny_or_allow(uid, result);
    }

    let Some(object) = &request.object else {
        return create_response(uid, false, "Missing object in request", Some("BadRequest"));
    };
    let es = match parse_object(object) {
        Ok(es) => es,
        Err(message) => return create_response(uid, false, &message, Some("BadRequest")),
    };
    let old = match &request.old_object {
        Some(obj) => match parse_object(obj) {
            Ok(old) => Some(old),
            Err(e) => {
                warn!(error = %e, "Failed to parse old Elasticsearch, treating as CREATE");
                None
            }
        },
        None => None,
    };

    // Status-only updates need no cluster facts
    if old.as_ref().is_some_and(|old| old.spec == es.spec) {
        return create_response(uid, true, "", None);
    }

    let facts = match gather_facts(state.lookup.as_ref(), &es).await {
        Ok(facts) => facts,
        Err(e) => return create_response(uid, false, &e.to_string(), Some("InternalError")),
    };
    let ctx = ValidationContext::new(&es, old.as_ref(), &facts, &state.min_memory);
    deny_or_allow(uid, validate_all(&ctx))
}

fn deny_or_allow(uid: &str, result: super::ValidationResult) -> AdmissionReviewResponse {
    if result.allowed {
        info!(uid = %uid, "Admission request allowed");
        return create_response(uid, true, "", None);
    }
    let reason = result
        .reason
        .unwrap_or_else(|| "ValidationFailed".to_string());
    let message = result
        .message
        .unwrap_or_else(|| "Validation failed".to_string());
    warn!(uid = %uid, reason = %reason, message = %message, "Admission request denied");
    create_response(uid, false, &message, Some(&reason))
}

/// Create an AdmissionReview response
fn create_response(
    uid: &str,
    allowed: bool,
    message: &str,
    reason: Option<&str>,
) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponse {
            uid: uid.to_string(),
            allowed,
            patch: None,
            patch_type: None,
            status: if allowed {
                None
            } else {
                Some(AdmissionStatus {
                    code: match reason {
                        Some("BadRequest") => 400,
                        Some("InternalError") => 500,
                        _ => 403,
                    },
                    message: message.to_string(),
                    reason: reason.map(String::from),
                })
            },
        },
    }
}

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Run the webhook server with TLS
///
/// TLS certificates are loaded from PEM files at the given paths.
pub async fn run_webhook_server(
    lookup: Arc<dyn ClusterLookup>,
    min_memory: String,
    port: u16,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::path::PathBuf;

    let state = Arc::new(WebhookState::new(lookup, min_memory));
    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Webhook server listening on {} with TLS", addr);

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

/// Errors that can occur when running the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Webhook server error: {0}")]
    Server(String),
}
