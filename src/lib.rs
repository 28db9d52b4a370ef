//! admission-standards library crate
//!
//! Admission policies enforcing organizational standards on Pods,
//! Deployments, Services and Ingresses, plus the HTTP plumbing that serves
//! them as a Kubernetes mutating webhook.

pub mod config;
pub mod health;
pub mod webhooks;

pub use config::{ConfigError, PolicyConfig};
pub use health::HealthState;
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, WebhookState,
    run_webhook_server,
};
