//! admission-standards - a Kubernetes mutating admission webhook enforcing
//! organizational resource standards.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Loads the policy configuration
//! - Starts the health server and the TLS webhook server

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info};

use admission_standards::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, PolicyConfig};
use admission_standards::health::{HealthState, run_health_server};
use admission_standards::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WebhookState, run_webhook_server,
};

/// Certificate path override
const CERT_PATH_ENV: &str = "WEBHOOK_CERT_PATH";
/// Private key path override
const KEY_PATH_ENV: &str = "WEBHOOK_KEY_PATH";

/// Grace period for in-flight admission reviews during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("admission_standards=info".parse()?),
        )
        .json()
        .init();

    info!("Starting admission-standards");

    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Arc::new(PolicyConfig::load(&config_path)?);

    let cert_path = std::env::var(CERT_PATH_ENV).unwrap_or_else(|_| WEBHOOK_CERT_PATH.to_string());
    let key_path = std::env::var(KEY_PATH_ENV).unwrap_or_else(|_| WEBHOOK_KEY_PATH.to_string());

    let health_state = Arc::new(HealthState::new());

    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let webhook_handle = {
        let state = Arc::new(WebhookState::new(config, Some(health_state.clone())));
        tokio::spawn(async move {
            if let Err(e) = run_webhook_server(state, &cert_path, &key_path).await {
                error!("Webhook server error: {}", e);
            }
        })
    };

    health_state.set_ready(true).await;

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = webhook_handle => {
            if let Err(e) = result {
                error!("Webhook server task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Stop the API server from routing new reviews here
            health_state.set_ready(false).await;

            info!(
                "Waiting {}s for in-flight admission reviews to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("Webhook stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal; without them the webhook cannot
/// shut down gracefully.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
