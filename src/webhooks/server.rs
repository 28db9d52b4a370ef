//! Admission webhook server.
//!
//! Serves one mutating endpoint per resource kind:
//! - `/admit-pod`
//! - `/admit-deploy`
//! - `/admit-svc`
//! - `/admit-ing-net`
//! - `/admit-ing-ext` (rejects `extensions/v1beta1` ingresses)
//!
//! Every endpoint accepts an `AdmissionReview` and answers with the
//! decision of the matching policy. Patches are returned as a JSONPatch.

use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::PolicyConfig;
use crate::health::{Decision, HealthState};
use crate::webhooks::patch::to_json_patch;
use crate::webhooks::policies::{self, AdmissionContext, ResourceKind, ResourceRef};

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/run/secrets/tls/cert.pem";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/run/secrets/tls/key.pem";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Shared state for webhook handlers
pub struct WebhookState {
    pub config: Arc<PolicyConfig>,
    /// Metrics sink, absent in tests
    pub health: Option<Arc<HealthState>>,
}

impl WebhookState {
    pub fn new(config: Arc<PolicyConfig>, health: Option<Arc<HealthState>>) -> Self {
        Self { config, health }
    }

    fn record(&self, kind: ResourceKind, decision: Decision, patches: usize, started: Instant) {
        if let Some(health) = &self.health {
            health.metrics.record_decision(
                kind,
                decision,
                patches,
                started.elapsed().as_secs_f64(),
            );
        }
    }
}

/// Route path served for `kind`
pub const fn route_for(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Pod => "/admit-pod",
        ResourceKind::Deployment => "/admit-deploy",
        ResourceKind::Service => "/admit-svc",
        ResourceKind::Ingress => "/admit-ing-net",
        ResourceKind::LegacyIngress => "/admit-ing-ext",
    }
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(route_for(ResourceKind::Pod), post(admit_pod))
        .route(route_for(ResourceKind::Deployment), post(admit_deployment))
        .route(route_for(ResourceKind::Service), post(admit_service))
        .route(route_for(ResourceKind::Ingress), post(admit_ingress))
        .route(
            route_for(ResourceKind::LegacyIngress),
            post(admit_legacy_ingress),
        )
        .with_state(state)
}

async fn admit_pod(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    handle_review(&state, ResourceKind::Pod, review)
}

async fn admit_deployment(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    handle_review(&state, ResourceKind::Deployment, review)
}

async fn admit_service(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    handle_review(&state, ResourceKind::Service, review)
}

async fn admit_ingress(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    handle_review(&state, ResourceKind::Ingress, review)
}

async fn admit_legacy_ingress(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    handle_review(&state, ResourceKind::LegacyIngress, review)
}

/// Unwrap the review, decide, and wrap the response
pub fn handle_review(
    state: &WebhookState,
    kind: ResourceKind,
    review: AdmissionReview<DynamicObject>,
) -> (StatusCode, Json<AdmissionReview<DynamicObject>>) {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, kind = %kind, "Failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            );
        }
    };

    (
        StatusCode::OK,
        Json(review_request(state, kind, &request).into_review()),
    )
}

/// Decide a single admission request for `kind`
pub fn review_request(
    state: &WebhookState,
    kind: ResourceKind,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let started = Instant::now();
    let uid = &request.uid;
    let target = ResourceRef::from_request(request);
    debug!(
        uid = %uid,
        kind = %kind,
        resource = %target.gvr(),
        operation = ?request.operation,
        namespace = %target.namespace,
        name = %target.name,
        "Processing admission request"
    );

    // DELETE operations are always allowed
    if request.operation == Operation::Delete {
        info!(uid = %uid, "Admission request allowed (DELETE)");
        state.record(kind, Decision::Allowed, 0, started);
        return AdmissionResponse::from(request);
    }

    // A missing object is only fatal once the evaluator has ruled out
    // namespace and identity exemptions.
    let ctx = AdmissionContext {
        target: &target,
        object: request.object.as_ref(),
        config: &state.config,
    };

    let patches = match policies::admit(kind, &ctx) {
        Ok(patches) => patches,
        Err(e) => {
            warn!(uid = %uid, reason = e.reason(), "Admission request denied");
            state.record(kind, Decision::Denied, 0, started);
            return AdmissionResponse::from(request).deny(e.to_string());
        }
    };

    if patches.is_empty() {
        info!(uid = %uid, "Admission request allowed");
        state.record(kind, Decision::Allowed, 0, started);
        return AdmissionResponse::from(request);
    }

    let response = to_json_patch(&patches)
        .map_err(|e| e.to_string())
        .and_then(|patch| {
            AdmissionResponse::from(request)
                .with_patch(patch)
                .map_err(|e| e.to_string())
        });

    match response {
        Ok(response) => {
            info!(uid = %uid, patches = patches.len(), "Admission request allowed with patches");
            state.record(kind, Decision::Patched, patches.len(), started);
            response
        }
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to serialize patch");
            state.record(kind, Decision::Denied, 0, started);
            AdmissionResponse::from(request).deny(format!("patch serialization error: {}", e))
        }
    }
}

/// Errors that can occur when running the webhook server
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[source] std::io::Error),

    #[error("Webhook server error: {0}")]
    Server(#[source] std::io::Error),
}

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:8443. TLS certificates are loaded from the paths
/// specified.
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(WebhookError::TlsConfig)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(port = WEBHOOK_PORT, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(WebhookError::Server)?;

    Ok(())
}
