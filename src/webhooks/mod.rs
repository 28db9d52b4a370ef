//! Webhook module for mutating admission requests.
//!
//! - `policies`: per-kind evaluators and the shared rule primitives
//! - `patch`: the patch model returned by evaluators
//! - `server`: axum endpoints translating AdmissionReviews into decisions

pub mod patch;
pub mod policies;
mod server;

pub use patch::{PatchOp, PatchOperation, PatchValue};
pub use policies::{AdmissionContext, AdmissionError, AdmissionResult, ResourceKind, ResourceRef};
pub use server::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, WebhookState,
    create_webhook_router, handle_review, review_request, route_for, run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
