// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for admission-standards.
//!
//! These tests run without a Kubernetes cluster and drive full admission
//! reviews through the decision pipeline.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use admission_standards::health::HealthState;
use admission_standards::webhooks::{
    AdmissionResponse, ResourceKind, WebhookState, handle_review, review_request,
};
use serde_json::Value;

use common::fixtures::{self, DeploymentBuilder, INETSVCS_HOST, IngressBuilder, NAMESPACE};

fn webhook_state() -> WebhookState {
    WebhookState::new(
        Arc::new(fixtures::test_config()),
        Some(Arc::new(HealthState::new())),
    )
}

fn decide<T: serde::Serialize>(
    state: &WebhookState,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
    object: &T,
) -> AdmissionResponse {
    let request = fixtures::admission_request(kind, "CREATE", namespace, name, Some(object));
    review_request(state, kind, &request)
}

/// Decode the JSONPatch carried by an allowed response
fn patch_ops(response: &AdmissionResponse) -> Vec<Value> {
    let bytes = response.patch.as_ref().expect("response should carry a patch");
    serde_json::from_slice::<Vec<Value>>(bytes).unwrap()
}

mod deployment_tests {
    use super::*;

    #[test]
    fn test_stable_tag_rejected() {
        let deploy = DeploymentBuilder::new("billing")
            .container("app", "registry/billing:stable")
            .build();
        let response = decide(&webhook_state(), ResourceKind::Deployment, NAMESPACE, "billing", &deploy);

        assert!(!response.allowed);
        assert!(
            response
                .result
                .message
                .contains("must not contain latest or stable")
        );
    }

    #[test]
    fn test_compliant_deployment_patched() {
        let deploy = DeploymentBuilder::new("billing")
            .container("app", "registry/billing:1.2.3")
            .container_with_env("proxy", "registry/envoy:1.30.1", &[("TZ", "Europe/Berlin")])
            .build();
        let response = decide(&webhook_state(), ResourceKind::Deployment, NAMESPACE, "billing", &deploy);

        assert!(response.allowed);
        let ops = patch_ops(&response);
        assert_eq!(ops.len(), 3);

        assert_eq!(ops[0]["op"], "replace");
        assert_eq!(ops[0]["path"], "/spec/template/spec/containers");
        let containers = ops[0]["value"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        for container in containers {
            assert_eq!(container["resources"]["requests"]["cpu"], "1m");
            assert_eq!(container["resources"]["requests"]["memory"], "8Mi");
        }
        assert_eq!(containers[0]["env"][0]["name"], "TZ");
        assert_eq!(containers[0]["env"][0]["value"], "UTC");
        assert_eq!(containers[1]["env"].as_array().unwrap().len(), 1);
        assert_eq!(containers[1]["env"][0]["value"], "Europe/Berlin");

        assert_eq!(ops[1]["op"], "add");
        assert_eq!(ops[1]["path"], "/spec/template/spec/securityContext/runAsNonRoot");
        assert_eq!(ops[1]["value"], true);
        assert_eq!(ops[2]["path"], "/spec/template/spec/securityContext/runAsUser");
        assert_eq!(ops[2]["value"], 65534);
    }

    #[test]
    fn test_exempt_deployment_allowed_unchanged() {
        let deploy = DeploymentBuilder::new("legacy-batch")
            .svc_label(None)
            .container("app", "registry/batch:latest")
            .build();
        let response = decide(
            &webhook_state(),
            ResourceKind::Deployment,
            NAMESPACE,
            "legacy-batch",
            &deploy,
        );
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_unmonitored_namespace_allowed_unchanged() {
        let deploy = DeploymentBuilder::new("billing")
            .namespace("kube-system")
            .without_description()
            .build();
        let response = decide(&webhook_state(), ResourceKind::Deployment, "kube-system", "billing", &deploy);
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_prefix_monitored_namespace_enforced() {
        let deploy = DeploymentBuilder::new("billing")
            .namespace("team-payments")
            .without_description()
            .build();
        let response = decide(&webhook_state(), ResourceKind::Deployment, "team-payments", "billing", &deploy);
        assert!(!response.allowed);
        assert!(
            response
                .result
                .message
                .ends_with("metadata.annotations.description is missing")
        );
    }

    #[test]
    fn test_root_conflict_rejected() {
        let deploy = DeploymentBuilder::new("billing")
            .container("app", "registry/billing:1.2.3")
            .run_as(Some(true), Some(0))
            .build();
        let response = decide(&webhook_state(), ResourceKind::Deployment, NAMESPACE, "billing", &deploy);
        assert!(!response.allowed);
        assert!(response.result.message.contains("runAsUser set to 0"));
    }
}

mod service_tests {
    use super::*;

    #[test]
    fn test_auth_service_allowed_without_patch() {
        let svc = fixtures::service("auth", NAMESPACE);
        let response = decide(&webhook_state(), ResourceKind::Service, NAMESPACE, "auth", &svc);
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_selector_mismatch_rejected() {
        let mut svc = fixtures::service("auth", NAMESPACE);
        svc.spec
            .as_mut()
            .unwrap()
            .selector
            .as_mut()
            .unwrap()
            .insert("svc".to_string(), "login".to_string());
        let response = decide(&webhook_state(), ResourceKind::Service, NAMESPACE, "auth", &svc);
        assert!(!response.allowed);
        assert_eq!(
            response.result.message,
            "Rejected service name: auth namespace: prod. spec.selector.svc: login must match service name: auth"
        );
    }
}

mod pod_tests {
    use super::*;

    #[test]
    fn test_pod_defaults_applied() {
        let pod = fixtures::pod("web", NAMESPACE, None);
        let response = decide(&webhook_state(), ResourceKind::Pod, NAMESPACE, "web", &pod);
        assert!(response.allowed);

        let ops = patch_ops(&response);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0]["path"], "/spec/securityContext/runAsNonRoot");
        assert_eq!(ops[1]["path"], "/spec/securityContext/runAsUser");
    }

    #[test]
    fn test_pod_root_uid_without_claim() {
        let pod = fixtures::pod("web", NAMESPACE, Some((None, Some(0))));
        let response = decide(&webhook_state(), ResourceKind::Pod, NAMESPACE, "web", &pod);
        assert!(response.allowed);

        let ops = patch_ops(&response);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["value"], false);
    }
}

mod ingress_tests {
    use super::*;

    #[test]
    fn test_catalog_minion_gets_svc_label() {
        let ingress = IngressBuilder::minion("catalog", "catalog").build();
        let response = decide(&webhook_state(), ResourceKind::Ingress, NAMESPACE, "catalog", &ingress);

        assert!(response.allowed);
        let ops = patch_ops(&response);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["op"], "add");
        assert_eq!(ops[0]["path"], "/metadata/labels/svc");
        assert_eq!(ops[0]["value"], "catalog");
    }

    #[test]
    fn test_wrong_path_rejected() {
        let ingress = IngressBuilder::minion("catalog", "catalog")
            .path("/catalog/")
            .build();
        let response = decide(&webhook_state(), ResourceKind::Ingress, NAMESPACE, "catalog", &ingress);
        assert!(!response.allowed);
        assert!(
            response
                .result
                .message
                .contains("spec.rules.http.paths.path is /catalog/ but expected /prod/catalog/")
        );
    }

    #[test]
    fn test_inetsvcs_alias() {
        let state = webhook_state();

        let ingress = IngressBuilder::minion("catalog-inetsvcs", "catalog")
            .host(INETSVCS_HOST)
            .label("svc", "catalog")
            .build();
        let response = decide(&state, ResourceKind::Ingress, NAMESPACE, "catalog-inetsvcs", &ingress);
        assert!(response.allowed);
        assert!(response.patch.is_none());

        let ingress = IngressBuilder::minion("catalog-inetsvcs", "catalog").build();
        let response = decide(&state, ResourceKind::Ingress, NAMESPACE, "catalog-inetsvcs", &ingress);
        assert!(!response.allowed);
    }

    #[test]
    fn test_disallowed_vendor_annotation() {
        let ingress = IngressBuilder::minion("catalog", "catalog")
            .annotation("nginx.org/server-snippets", "return 301;")
            .build();
        let response = decide(&webhook_state(), ResourceKind::Ingress, NAMESPACE, "catalog", &ingress);
        assert!(!response.allowed);
        assert!(
            response
                .result
                .message
                .contains("metadata.annotation.nginx.org/server-snippets: return 301; is invalid or not allowed")
        );
    }

    #[test]
    fn test_exempt_ingress() {
        let ingress = IngressBuilder::minion("edge", "catalog").host("unknown.example.com").build();
        let response = decide(&webhook_state(), ResourceKind::Ingress, NAMESPACE, "edge", &ingress);
        assert!(response.allowed);
    }

    fn extensions_ingress(name: &str) -> Value {
        serde_json::json!({
            "apiVersion": "extensions/v1beta1",
            "kind": "Ingress",
            "metadata": {"name": name, "namespace": NAMESPACE},
            "spec": {"backend": {"serviceName": name, "servicePort": 80}}
        })
    }

    #[test]
    fn test_extensions_ingress_rejected() {
        let ingress = extensions_ingress("catalog");
        let response = decide(&webhook_state(), ResourceKind::LegacyIngress, NAMESPACE, "catalog", &ingress);
        assert!(!response.allowed);
        assert_eq!(
            response.result.message,
            "Rejected ingress name: catalog namespace: prod. apiVersion: extensions/v1beta1 is deprecated, use networking.k8s.io/v1"
        );
    }

    #[test]
    fn test_extensions_ingress_exempt_and_unmonitored_allowed() {
        let state = webhook_state();

        let ingress = extensions_ingress("edge");
        let response = decide(&state, ResourceKind::LegacyIngress, NAMESPACE, "edge", &ingress);
        assert!(response.allowed);

        let ingress = extensions_ingress("catalog");
        let response = decide(&state, ResourceKind::LegacyIngress, "kube-system", "catalog", &ingress);
        assert!(response.allowed);
    }

    #[test]
    fn test_networking_ingress_passes_extensions_endpoint() {
        // A networking.k8s.io/v1 ingress sent to the extensions endpoint is let through
        let ingress = IngressBuilder::minion("catalog", "catalog").build();
        let request =
            fixtures::admission_request(ResourceKind::Ingress, "CREATE", NAMESPACE, "catalog", Some(&ingress));
        let response = review_request(&webhook_state(), ResourceKind::LegacyIngress, &request);
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }
}

mod transport_tests {
    use super::*;
    use admission_standards::webhooks::AdmissionReview;
    use axum::http::StatusCode;
    use kube::core::DynamicObject;

    #[test]
    fn test_delete_allowed_without_object() {
        let request = fixtures::admission_request::<Value>(
            ResourceKind::Deployment,
            "DELETE",
            NAMESPACE,
            "billing",
            None,
        );
        let response = review_request(&webhook_state(), ResourceKind::Deployment, &request);
        assert!(response.allowed);
    }

    #[test]
    fn test_missing_object_in_unmonitored_namespace_allowed() {
        let state = webhook_state();
        for kind in ResourceKind::ALL {
            let request = fixtures::admission_request::<Value>(kind, "UPDATE", "kube-system", "x", None);
            let response = review_request(&state, kind, &request);
            assert!(response.allowed, "{} should be allowed", kind);
            assert!(response.patch.is_none());
        }
    }

    #[test]
    fn test_missing_object_for_exempt_identity_allowed() {
        let request =
            fixtures::admission_request::<Value>(ResourceKind::Service, "UPDATE", NAMESPACE, "legacy-batch", None);
        let response = review_request(&webhook_state(), ResourceKind::Service, &request);
        assert!(response.allowed);
    }

    #[test]
    fn test_missing_object_denied_when_enforced() {
        let request = fixtures::admission_request::<Value>(ResourceKind::Pod, "UPDATE", NAMESPACE, "web", None);
        let response = review_request(&webhook_state(), ResourceKind::Pod, &request);
        assert!(!response.allowed);
        assert_eq!(
            response.result.message,
            "pod object is missing from the admission request"
        );
    }

    #[test]
    fn test_review_without_request_is_bad_request() {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview"
        }))
        .unwrap();

        let (status, _) = handle_review(&webhook_state(), ResourceKind::Pod, review);
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_wrong_route_allows_unchanged() {
        // A Service sent to the deployment endpoint is let through
        let svc = fixtures::service("auth", NAMESPACE);
        let request =
            fixtures::admission_request(ResourceKind::Service, "CREATE", NAMESPACE, "auth", Some(&svc));
        let response = review_request(&webhook_state(), ResourceKind::Deployment, &request);
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_decisions_recorded() {
        let state = webhook_state();
        let svc = fixtures::service("auth", NAMESPACE);
        decide(&state, ResourceKind::Service, NAMESPACE, "auth", &svc);
        let deploy = DeploymentBuilder::new("billing")
            .container("app", "registry/billing:1.2.3")
            .build();
        decide(&state, ResourceKind::Deployment, NAMESPACE, "billing", &deploy);

        let metrics = state.health.as_ref().unwrap().metrics.encode();
        assert!(metrics.contains("kind=\"service\""));
        assert!(metrics.contains("decision=\"patched\""));
        assert!(metrics.contains("admission_patches_total"));
    }
}
