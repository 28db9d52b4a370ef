//! Ingress policy for NGINX mergeable ingresses.
//!
//! Every ingress must declare exactly one rule for a known host and be
//! either a `master` or a `minion`. Vendor annotations are checked against
//! the allow table for that type.
//!
//! Minions carry further conventions:
//! - exactly one path, equal to `/{namespace}/{service}/`
//! - required annotations and labels from configuration
//! - `nginx.org/ssl-services` naming the backend service
//! - `svc` label equal to the backend service, added when absent
//! - ingress name is the service name, or `{service}-inetsvcs` on an
//!   inetsvcs host

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress, IngressRule};

use super::rules::{self, VENDOR_ANNOTATION_PREFIXES};
use super::{
    AdmissionContext, AdmissionError, AdmissionResult, ResourceKind, ResourceRef, SVC_LABEL,
    Subject, decode, exemption, kind_mismatch, log_patches,
};
use crate::config::PolicyConfig;
use crate::webhooks::patch::PatchOperation;

pub const MERGEABLE_TYPE_ANNOTATION: &str = "nginx.org/mergeable-ingress-type";
pub const SSL_SERVICES_ANNOTATION: &str = "nginx.org/ssl-services";

/// Marker shared by internet-facing hosts and their ingress names
pub const INETSVCS_MARKER: &str = "inetsvcs";

/// Mergeable ingress role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressType {
    Master,
    Minion,
}

impl IngressType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "master" => Some(IngressType::Master),
            "minion" => Some(IngressType::Minion),
            _ => None,
        }
    }

    /// Allow table for vendor annotations on this type
    fn allowed_annotations(self, config: &PolicyConfig) -> &rules::RuleTable {
        match self {
            IngressType::Master => config.master_annotations(),
            IngressType::Minion => config.minion_annotations(),
        }
    }
}

impl fmt::Display for IngressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngressType::Master => write!(f, "master"),
            IngressType::Minion => write!(f, "minion"),
        }
    }
}

/// Outcome of the minion naming convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameCheck {
    /// Name equals the backend service
    MatchesService,
    /// Name is `{service}-inetsvcs` and the host is an inetsvcs host
    InetsvcsAlias,
    /// Name is `{service}-inetsvcs` but the host is not an inetsvcs host
    InetsvcsHostMismatch,
    /// Name is neither form
    Invalid,
}

/// Classify an ingress name against its backend service and host
pub fn classify_name(name: &str, service: &str, host: &str) -> NameCheck {
    if name == service {
        return NameCheck::MatchesService;
    }

    let is_alias = name
        .strip_prefix(service)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|suffix| suffix == INETSVCS_MARKER);
    if !is_alias {
        return NameCheck::Invalid;
    }

    if host.contains(INETSVCS_MARKER) {
        NameCheck::InetsvcsAlias
    } else {
        NameCheck::InetsvcsHostMismatch
    }
}

/// Path a minion must route: `/{namespace}/{service}/`
pub fn expected_path(namespace: &str, service: &str) -> String {
    format!("/{}/{}/", namespace, service)
}

pub fn admit(ctx: &AdmissionContext<'_>) -> AdmissionResult {
    if exemption::check(ResourceKind::Ingress, ctx.target, ctx.config).is_some() {
        return Ok(Vec::new());
    }

    if kind_mismatch(ResourceKind::Ingress, ctx.target) {
        return Ok(Vec::new());
    }

    let ingress: Ingress = decode(ResourceKind::Ingress, ctx)?;
    evaluate(&ingress, ctx.target, ctx.config)
}

/// Apply the ingress rules to a decoded Ingress
pub fn evaluate(ingress: &Ingress, target: &ResourceRef, config: &PolicyConfig) -> AdmissionResult {
    let subject = Subject::new(ResourceKind::Ingress, &ingress.metadata, target);
    subject.log_validating();

    let rule = single_rule(ingress, &subject)?;
    let host = rule.host.as_deref().unwrap_or_default();
    if !config.host_is_valid(host) {
        return Err(subject.reject(format!(
            "spec.rules.host: {} is not a known hostname.",
            host
        )));
    }

    let Some(annotations) = ingress.metadata.annotations.as_ref() else {
        return Err(subject.reject("metadata.annotations object is missing"));
    };

    let Some(raw_type) = annotations.get(MERGEABLE_TYPE_ANNOTATION) else {
        return Err(subject.reject(format!(
            "metadata.annotations {} is missing",
            MERGEABLE_TYPE_ANNOTATION
        )));
    };
    let Some(ingress_type) = IngressType::parse(raw_type) else {
        return Err(subject.reject(format!(
            "metadata.annotations {}: {} is invalid",
            MERGEABLE_TYPE_ANNOTATION, raw_type
        )));
    };

    rules::check_allowed(
        annotations,
        &VENDOR_ANNOTATION_PREFIXES,
        ingress_type.allowed_annotations(config),
    )
    .map_err(|v| {
        subject.reject(format!(
            "metadata.annotation.{}: {} is invalid or not allowed",
            v.key, v.value
        ))
    })?;

    let patches = match ingress_type {
        IngressType::Master => Vec::new(),
        IngressType::Minion => {
            evaluate_minion(ingress, rule, host, annotations, &subject, config)?
        }
    };

    log_patches(&subject, &patches);
    Ok(patches)
}

fn single_rule<'a>(
    ingress: &'a Ingress,
    subject: &Subject<'_>,
) -> Result<&'a IngressRule, AdmissionError> {
    let Some(rules) = ingress.spec.as_ref().and_then(|s| s.rules.as_ref()) else {
        return Err(subject.reject("Rules object is missing"));
    };
    match rules.as_slice() {
        [rule] => Ok(rule),
        _ => Err(subject.reject("Rules array has more than one entry specified")),
    }
}

fn single_path<'a>(
    rule: &'a IngressRule,
    subject: &Subject<'_>,
) -> Result<&'a HTTPIngressPath, AdmissionError> {
    let Some(http) = rule.http.as_ref() else {
        return Err(subject.reject("spec.rules.http object is missing"));
    };
    match http.paths.as_slice() {
        [] => Err(subject.reject("spec.rules.http.paths object is missing")),
        [path] => Ok(path),
        _ => Err(subject.reject("spec.rules.http.paths array has more than one entry specified")),
    }
}

fn evaluate_minion(
    ingress: &Ingress,
    rule: &IngressRule,
    host: &str,
    annotations: &BTreeMap<String, String>,
    subject: &Subject<'_>,
    config: &PolicyConfig,
) -> AdmissionResult {
    let path = single_path(rule, subject)?;
    let service = path
        .backend
        .service
        .as_ref()
        .map(|s| s.name.as_str())
        .unwrap_or_default();

    let declared = path.path.as_deref().unwrap_or_default();
    let expected = expected_path(subject.namespace, service);
    if declared != expected {
        return Err(subject.reject(format!(
            "spec.rules.http.paths.path is {} but expected {}",
            declared, expected
        )));
    }

    rules::check_required(Some(annotations), config.minion_required_annotations()).map_err(
        |v| {
            subject.reject(format!(
                "metadata.annotation.{}: {} is missing or invalid",
                v.key, v.value
            ))
        },
    )?;

    let Some(ssl_services) = annotations.get(SSL_SERVICES_ANNOTATION) else {
        return Err(subject.reject(format!(
            "metadata.annotations {} is missing",
            SSL_SERVICES_ANNOTATION
        )));
    };
    if ssl_services != service {
        return Err(subject.reject(format!(
            "metadata.annotations {}: {} does not match backend service name: {}",
            SSL_SERVICES_ANNOTATION, ssl_services, service
        )));
    }

    let labels = ingress.metadata.labels.as_ref();
    rules::check_required(labels, config.minion_required_labels()).map_err(|v| {
        subject.reject(format!(
            "metadata.labels.{}: {} is missing or invalid",
            v.key, v.value
        ))
    })?;

    let mut patches = Vec::new();
    match labels.and_then(|l| l.get(SVC_LABEL)) {
        Some(label) if label != service => {
            return Err(subject.reject(format!(
                "metadata.labels.svc: {} is invalid, it must match backend service name: {}",
                label, service
            )));
        }
        Some(_) => {}
        None => {
            tracing::info!(
                name = %subject.name,
                namespace = %subject.namespace,
                svc = %service,
                "Ingress is missing svc label, adding it"
            );
            patches.push(svc_label_patch(labels.is_some(), service));
        }
    }

    match classify_name(subject.name, service, host) {
        NameCheck::MatchesService | NameCheck::InetsvcsAlias => Ok(patches),
        NameCheck::InetsvcsHostMismatch => Err(subject.reject(format!(
            "Ingress name can only contain {} if hostname contains {}, host: {}",
            INETSVCS_MARKER, INETSVCS_MARKER, host
        ))),
        NameCheck::Invalid => Err(subject.reject(format!(
            "Ingress name must be either {} or {}-{}",
            service, service, INETSVCS_MARKER
        ))),
    }
}

/// Add the `svc` label, creating the labels map when the object has none
fn svc_label_patch(has_labels: bool, service: &str) -> PatchOperation {
    if has_labels {
        PatchOperation::add(["metadata", "labels", SVC_LABEL], service)
    } else {
        PatchOperation::add(
            ["metadata", "labels"],
            BTreeMap::from([(SVC_LABEL.to_string(), service.to_string())]),
        )
    }
}
