//! Deployment policy.
//!
//! Validates:
//! - `metadata.annotations.description` is present
//! - deployment name, `metadata.labels.svc`, template `svc` label and
//!   selector `svc` label are all equal
//! - no container image uses a `latest` or `stable` tag
//!
//! Mutates:
//! - every container's CPU/memory requests are replaced with fixed values
//! - every container gets `TZ=UTC` unless it already declares `TZ`
//! - pod template security context is defaulted to run as non-root

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, EnvVar};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::security_context::{RunAs, TEMPLATE_SECURITY_CONTEXT, default_run_as};
use super::{
    AdmissionContext, AdmissionError, AdmissionResult, DESCRIPTION_ANNOTATION, ResourceKind,
    ResourceRef, SVC_LABEL, Subject, decode, exemption, kind_mismatch, log_patches,
};
use crate::webhooks::patch::PatchOperation;

/// CPU request forced onto every container
pub const CPU_REQUEST: &str = "1m";
/// Memory request forced onto every container
pub const MEMORY_REQUEST: &str = "8Mi";
/// Environment variable carrying the container timezone
pub const TZ_ENV: &str = "TZ";
pub const TZ_DEFAULT: &str = "UTC";

/// Image tag fragments that are never pinned versions
const FLOATING_TAGS: [&str; 2] = ["latest", "stable"];

const CONTAINERS_PATH: [&str; 4] = ["spec", "template", "spec", "containers"];

pub fn admit(ctx: &AdmissionContext<'_>) -> AdmissionResult {
    if kind_mismatch(ResourceKind::Deployment, ctx.target) {
        return Ok(Vec::new());
    }

    if exemption::check(ResourceKind::Deployment, ctx.target, ctx.config).is_some() {
        return Ok(Vec::new());
    }

    let deploy: Deployment = decode(ResourceKind::Deployment, ctx)?;
    evaluate(&deploy, ctx.target)
}

/// Apply the deployment rules to a decoded Deployment
pub fn evaluate(deploy: &Deployment, target: &ResourceRef) -> AdmissionResult {
    let subject = Subject::new(ResourceKind::Deployment, &deploy.metadata, target);
    subject.log_validating();

    validate_identity(deploy, &subject)?;

    let template_spec = deploy
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref());
    let containers = template_spec.map(|s| s.containers.as_slice()).unwrap_or_default();

    let mut rewritten = Vec::with_capacity(containers.len());
    for container in containers {
        let image = container.image.as_deref().unwrap_or_default().to_lowercase();
        if uses_floating_tag(&image) {
            return Err(subject.reject(format!(
                "container image tag: {} must not contain latest or stable, use specific version tag",
                image
            )));
        }

        let mut container = container.clone();
        apply_request_defaults(&mut container);
        ensure_timezone(&mut container);
        rewritten.push(container);
    }

    let mut patches = vec![PatchOperation::replace(CONTAINERS_PATH, rewritten)];

    patches.extend(
        default_run_as(&TEMPLATE_SECURITY_CONTEXT, RunAs::from_pod_spec(template_spec))
            .inspect_err(|e| {
                tracing::warn!(
                    name = %subject.name,
                    namespace = %subject.namespace,
                    reason = e.reason(),
                    "Rejected deployment: {}",
                    e
                );
            })?,
    );

    log_patches(&subject, &patches);
    Ok(patches)
}

/// Check name == metadata.svc == template.svc == selector.svc and the
/// description annotation
fn validate_identity(deploy: &Deployment, subject: &Subject<'_>) -> Result<(), AdmissionError> {
    let metadata = &deploy.metadata;

    let Some(annotations) = metadata.annotations.as_ref() else {
        return Err(subject.reject("metadata.annotations object is missing"));
    };
    if !annotations.contains_key(DESCRIPTION_ANNOTATION) {
        return Err(subject.reject("metadata.annotations.description is missing"));
    }

    let Some(svc) = label(metadata.labels.as_ref()) else {
        return Err(subject.reject("metadata.labels.svc is missing"));
    };
    if svc != subject.name {
        return Err(subject.reject(format!(
            "metadata.labels.svc: {} must be equal to deployment name",
            svc
        )));
    }

    let spec = deploy.spec.as_ref();

    let template_labels = spec
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref());
    let Some(template_svc) = label(template_labels) else {
        return Err(subject.reject("spec.template.metadata.labels.svc is missing"));
    };
    if template_svc != svc {
        return Err(subject.reject(format!(
            "spec.template.metadata.labels.svc: {} must be equal to metadata.labels.svc: {}",
            template_svc, svc
        )));
    }

    let match_labels = spec.and_then(|s| s.selector.match_labels.as_ref());
    let Some(selector_svc) = label(match_labels) else {
        return Err(subject.reject("spec.selector.matchLabels.svc is missing"));
    };
    if selector_svc != svc {
        return Err(subject.reject(format!(
            "spec.selector.matchLabels.svc: {} must be equal to metadata.labels.svc: {}",
            selector_svc, svc
        )));
    }

    Ok(())
}

fn label(labels: Option<&BTreeMap<String, String>>) -> Option<&str> {
    labels.and_then(|l| l.get(SVC_LABEL)).map(String::as_str)
}

/// Whether a lowercased image reference names a floating tag
pub fn uses_floating_tag(image: &str) -> bool {
    FLOATING_TAGS.iter().any(|tag| image.contains(tag))
}

/// Replace the container's requests with the fixed CPU/memory values.
/// Limits are left as declared.
pub fn apply_request_defaults(container: &mut Container) {
    let resources = container.resources.get_or_insert_with(Default::default);
    resources.requests = Some(BTreeMap::from([
        ("cpu".to_string(), Quantity(CPU_REQUEST.to_string())),
        ("memory".to_string(), Quantity(MEMORY_REQUEST.to_string())),
    ]));
}

/// Append `TZ=UTC` unless an entry named `TZ` already exists
pub fn ensure_timezone(container: &mut Container) {
    let env = container.env.get_or_insert_with(Vec::new);
    if env.iter().any(|e| e.name == TZ_ENV) {
        return;
    }
    env.push(EnvVar {
        name: TZ_ENV.to_string(),
        value: Some(TZ_DEFAULT.to_string()),
        ..Default::default()
    });
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::webhooks::patch::{PatchOp, PatchValue};
    use crate::webhooks::policies::testing::{dynamic, prod_config};
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{
        PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

    fn labels(svc: &str) -> Option<BTreeMap<String, String>> {
        Some(BTreeMap::from([(SVC_LABEL.to_string(), svc.to_string())]))
    }

    fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    fn create_deployment(name: &str, containers: Vec<Container>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("prod".to_string()),
                labels: labels(name),
                annotations: Some(BTreeMap::from([(
                    DESCRIPTION_ANNOTATION.to_string(),
                    "x".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                selector: LabelSelector {
                    match_labels: labels(name),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: labels(name),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    fn target(name: &str) -> ResourceRef {
        ResourceRef::new(ResourceKind::Deployment, "prod", name)
    }

    fn rewritten_containers(patches: &[PatchOperation]) -> Vec<Container> {
        let op = patches
            .iter()
            .find(|p| p.path() == "/spec/template/spec/containers")
            .expect("should have containers patch");
        assert_eq!(op.op, PatchOp::Replace);
        match &op.value {
            PatchValue::Containers(c) => c.clone(),
            other => panic!("unexpected value {:?}", other),
        }
    }

    fn expect_rejection(deploy: &Deployment, fragment: &str) {
        let err = evaluate(deploy, &target("billing")).unwrap_err();
        assert!(
            err.to_string().contains(fragment),
            "expected '{}' in '{}'",
            fragment,
            err
        );
    }

    #[test]
    fn test_valid_deployment_is_patched() {
        let deploy = create_deployment("billing", vec![container("app", "registry/billing:1.2.3")]);
        let patches = evaluate(&deploy, &target("billing")).unwrap();

        // containers replace + runAsNonRoot + runAsUser
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[0].path(), "/spec/template/spec/containers");
        assert_eq!(
            patches[1].path(),
            "/spec/template/spec/securityContext/runAsNonRoot"
        );
        assert_eq!(
            patches[2].path(),
            "/spec/template/spec/securityContext/runAsUser"
        );
    }

    #[test]
    fn test_stable_tag_rejected() {
        let deploy = create_deployment("billing", vec![container("app", "registry/billing:stable")]);
        expect_rejection(&deploy, "must not contain latest or stable");
    }

    #[test]
    fn test_latest_tag_rejected_case_insensitive() {
        let deploy = create_deployment(
            "billing",
            vec![
                container("app", "registry/billing:1.0.0"),
                container("sidecar", "registry/proxy:LATEST"),
            ],
        );
        expect_rejection(&deploy, "registry/proxy:latest");
    }

    #[test]
    fn test_missing_annotations() {
        let mut deploy = create_deployment("billing", vec![]);
        deploy.metadata.annotations = None;
        expect_rejection(&deploy, "metadata.annotations object is missing");
    }

    #[test]
    fn test_missing_description() {
        let mut deploy = create_deployment("billing", vec![]);
        deploy.metadata.annotations = Some(BTreeMap::new());
        expect_rejection(&deploy, "metadata.annotations.description is missing");
    }

    #[test]
    fn test_missing_svc_label() {
        let mut deploy = create_deployment("billing", vec![]);
        deploy.metadata.labels = None;
        expect_rejection(&deploy, "metadata.labels.svc is missing");
    }

    #[test]
    fn test_svc_label_must_equal_name() {
        let mut deploy = create_deployment("billing", vec![]);
        deploy.metadata.labels = labels("invoices");
        expect_rejection(&deploy, "metadata.labels.svc: invoices must be equal to deployment name");
    }

    #[test]
    fn test_template_svc_label() {
        let mut deploy = create_deployment("billing", vec![]);
        let spec = deploy.spec.as_mut().unwrap();
        spec.template.metadata = None;
        expect_rejection(&deploy, "spec.template.metadata.labels.svc is missing");

        let spec = deploy.spec.as_mut().unwrap();
        spec.template.metadata = Some(ObjectMeta {
            labels: labels("other"),
            ..Default::default()
        });
        expect_rejection(&deploy, "spec.template.metadata.labels.svc: other");
    }

    #[test]
    fn test_selector_svc_label() {
        let mut deploy = create_deployment("billing", vec![]);
        deploy.spec.as_mut().unwrap().selector.match_labels = None;
        expect_rejection(&deploy, "spec.selector.matchLabels.svc is missing");

        deploy.spec.as_mut().unwrap().selector.match_labels = labels("other");
        expect_rejection(&deploy, "spec.selector.matchLabels.svc: other");
    }

    #[test]
    fn test_requests_replaced_not_merged() {
        let mut app = container("app", "registry/billing:1.2.3");
        app.resources = Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("2".to_string())),
                ("nvidia.com/gpu".to_string(), Quantity("1".to_string())),
            ])),
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity("1Gi".to_string()),
            )])),
            ..Default::default()
        });
        let deploy = create_deployment("billing", vec![app]);

        let containers = rewritten_containers(&evaluate(&deploy, &target("billing")).unwrap());
        let resources = containers[0].resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests.get("cpu").unwrap().0, CPU_REQUEST);
        assert_eq!(requests.get("memory").unwrap().0, MEMORY_REQUEST);
        assert_eq!(
            resources.limits.as_ref().unwrap().get("memory").unwrap().0,
            "1Gi"
        );
    }

    #[test]
    fn test_timezone_added_when_missing() {
        let deploy = create_deployment("billing", vec![container("app", "registry/billing:1.2.3")]);
        let containers = rewritten_containers(&evaluate(&deploy, &target("billing")).unwrap());
        let env = containers[0].env.as_ref().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, TZ_ENV);
        assert_eq!(env[0].value.as_deref(), Some(TZ_DEFAULT));
    }

    #[test]
    fn test_existing_timezone_preserved() {
        let mut app = container("app", "registry/billing:1.2.3");
        app.env = Some(vec![
            EnvVar {
                name: "LOG_LEVEL".to_string(),
                value: Some("info".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: TZ_ENV.to_string(),
                value: Some("America/Chicago".to_string()),
                ..Default::default()
            },
        ]);
        let deploy = create_deployment("billing", vec![app]);

        let containers = rewritten_containers(&evaluate(&deploy, &target("billing")).unwrap());
        let env = containers[0].env.as_ref().unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[1].value.as_deref(), Some("America/Chicago"));
    }

    #[test]
    fn test_security_context_conflict_rejected() {
        let mut deploy = create_deployment("billing", vec![container("app", "registry/billing:1")]);
        deploy
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .security_context = Some(PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(0),
            ..Default::default()
        });

        let err = evaluate(&deploy, &target("billing")).unwrap_err();
        assert!(matches!(err, AdmissionError::RootUserConflict));
    }

    #[test]
    fn test_compliant_security_context_only_patches_containers() {
        let mut deploy = create_deployment("billing", vec![container("app", "registry/billing:1")]);
        deploy
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .security_context = Some(PodSecurityContext {
            run_as_non_root: Some(true),
            ..Default::default()
        });

        let patches = evaluate(&deploy, &target("billing")).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path(), "/spec/template/spec/containers");
    }

    #[test]
    fn test_exempt_deployment_skips_rules() {
        let deploy = create_deployment("billing", vec![container("app", "registry/billing:latest")]);
        let object = dynamic(&deploy);
        let config = prod_config().with_exempt(ResourceKind::Deployment, "prod/billing");
        let target = target("billing");

        let patches = admit(&AdmissionContext {
            target: &target,
            object: Some(&object),
            config: &config,
        })
        .unwrap();
        assert!(patches.is_empty());
    }

    #[test]
    fn test_admit_decodes_request_object() {
        let deploy = create_deployment("billing", vec![container("app", "registry/billing:2.0.1")]);
        let object = dynamic(&deploy);
        let config = prod_config();
        let target = target("billing");

        let patches = admit(&AdmissionContext {
            target: &target,
            object: Some(&object),
            config: &config,
        })
        .unwrap();
        assert_eq!(patches.len(), 3);
    }

    #[test]
    fn test_floating_tag_detection() {
        assert!(uses_floating_tag("nginx:latest"));
        assert!(uses_floating_tag("registry/stable-images/app:1.0"));
        assert!(!uses_floating_tag("registry/app:1.2.3"));
    }
}
