//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 once the webhook is serving)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

use crate::webhooks::policies::ResourceKind;

/// Health server port
pub const HEALTH_PORT: u16 = 8080;

/// Final outcome of one admission review
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Decision {
    /// Allowed unchanged
    Allowed,
    /// Allowed with at least one patch
    Patched,
    Denied,
}

impl Decision {
    pub const fn as_str(self) -> &'static str {
        match self {
            Decision::Allowed => "allowed",
            Decision::Patched => "patched",
            Decision::Denied => "denied",
        }
    }
}

/// Labels for per-decision metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DecisionLabels {
    pub kind: ResourceKind,
    pub decision: Decision,
}

impl EncodeLabelSet for DecisionLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.label()).encode(encoder.encode_label())?;
        ("decision", self.decision.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-kind metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KindLabels {
    pub kind: ResourceKind,
}

impl EncodeLabelSet for KindLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.label()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the webhook
pub struct Metrics {
    /// Admission reviews by kind and decision
    pub requests_total: Family<DecisionLabels, Counter>,
    /// Patch operations returned, by kind
    pub patches_total: Family<KindLabels, Counter>,
    /// Time spent deciding, by kind
    pub decision_duration_seconds: Family<KindLabels, Histogram>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "admission_requests",
            "Total number of admission reviews by kind and decision",
            requests_total.clone(),
        );

        let patches_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "admission_patches",
            "Total number of patch operations returned",
            patches_total.clone(),
        );

        let decision_duration_seconds =
            Family::<KindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.0001, 2.0, 15))
            });
        registry.register(
            "admission_decision_duration_seconds",
            "Duration of admission decisions in seconds",
            decision_duration_seconds.clone(),
        );

        Self {
            requests_total,
            patches_total,
            decision_duration_seconds,
            registry,
        }
    }

    /// Record one admission decision
    pub fn record_decision(
        &self,
        kind: ResourceKind,
        decision: Decision,
        patches: usize,
        duration_secs: f64,
    ) {
        self.requests_total
            .get_or_create(&DecisionLabels { kind, decision })
            .inc();

        let labels = KindLabels { kind };
        if patches > 0 {
            self.patches_total
                .get_or_create(&labels)
                .inc_by(patches as u64);
        }
        self.decision_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the webhook is serving
    ready: RwLock<bool>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the webhook server is started
/// and again once shutdown begins.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT));
    info!(port = HEALTH_PORT, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
