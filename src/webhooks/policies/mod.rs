//! Admission policies for organizational resource standards.
//!
//! Each supported kind has its own evaluator:
//! - Pod: security-context defaulting
//! - Deployment: naming/label consistency, image tag hygiene, request and
//!   timezone defaulting, security-context defaulting
//! - Service: naming/label consistency (validate only)
//! - Ingress: mergeable master/minion routing conventions
//! - Legacy ingress: rejects the removed `extensions/v1beta1` API
//!
//! Evaluators are pure functions of the request identity, the object under
//! review and the static [`PolicyConfig`]. They either allow (optionally with
//! patches) or reject with a message naming the offending field.

pub mod deployment;
pub mod exemption;
pub mod ingress;
pub mod legacy_ingress;
pub mod pod;
pub mod rules;
pub mod security_context;
pub mod service;

use std::fmt;

use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::PolicyConfig;
use crate::webhooks::patch::PatchOperation;

/// Label tying workloads, services and ingresses to one service name
pub const SVC_LABEL: &str = "svc";

/// Annotation every deployment and service must carry
pub const DESCRIPTION_ANNOTATION: &str = "description";

/// Resource kinds handled by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pod,
    Deployment,
    Service,
    Ingress,
    /// Ingress submitted through the removed `extensions/v1beta1` API
    LegacyIngress,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Pod,
        ResourceKind::Deployment,
        ResourceKind::Service,
        ResourceKind::Ingress,
        ResourceKind::LegacyIngress,
    ];

    /// Lowercase name used in messages and metrics
    pub const fn label(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Service => "service",
            ResourceKind::Ingress => "ingress",
            ResourceKind::LegacyIngress => "legacy-ingress",
        }
    }

    pub const fn group(self) -> &'static str {
        match self {
            ResourceKind::Pod | ResourceKind::Service => "",
            ResourceKind::Deployment => "apps",
            ResourceKind::Ingress => "networking.k8s.io",
            ResourceKind::LegacyIngress => "extensions",
        }
    }

    pub const fn version(self) -> &'static str {
        match self {
            ResourceKind::LegacyIngress => "v1beta1",
            _ => "v1",
        }
    }

    /// Plural resource name as it appears in the request's resource tag
    pub const fn plural(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pods",
            ResourceKind::Deployment => "deployments",
            ResourceKind::Service => "services",
            ResourceKind::Ingress | ResourceKind::LegacyIngress => "ingresses",
        }
    }

    /// Whether a request's group/version/resource tag is this kind
    pub fn matches(self, target: &ResourceRef) -> bool {
        target.group == self.group()
            && target.version == self.version()
            && target.resource == self.plural()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of the object under review, taken from the admission request
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub operation: Operation,
}

impl ResourceRef {
    /// A CREATE reference tagged as `kind`
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: kind.group().to_string(),
            version: kind.version().to_string(),
            resource: kind.plural().to_string(),
            namespace: namespace.into(),
            name: name.into(),
            operation: Operation::Create,
        }
    }

    pub fn from_request<T: kube::Resource>(request: &AdmissionRequest<T>) -> Self {
        Self {
            group: request.resource.group.clone(),
            version: request.resource.version.clone(),
            resource: request.resource.resource.clone(),
            namespace: request.namespace.clone().unwrap_or_default(),
            name: request.name.clone(),
            operation: request.operation.clone(),
        }
    }

    /// `group/version/resource` for logging
    pub fn gvr(&self) -> String {
        format!("{}/{}/{}", self.group, self.version, self.resource)
    }
}

/// Inputs shared by every evaluator
pub struct AdmissionContext<'a> {
    /// Identity and kind tag from the request
    pub target: &'a ResourceRef,
    /// Raw object from the request
    pub object: Option<&'a DynamicObject>,
    /// Static configuration snapshot
    pub config: &'a PolicyConfig,
}

/// Reasons an object is rejected
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// The object could not be decoded into the expected kind
    #[error("could not deserialize {kind} object: {source}, {kind} is being rejected")]
    Decode {
        kind: ResourceKind,
        #[source]
        source: serde_json::Error,
    },

    /// The request carried no object to evaluate
    #[error("{0} object is missing from the admission request")]
    MissingObject(ResourceKind),

    /// A field is missing, mismatched or fails its pattern
    #[error("{0}")]
    Violation(String),

    /// runAsNonRoot=true together with runAsUser=0
    #[error("runAsNonRoot specified, but runAsUser set to 0 (the root user)")]
    RootUserConflict,
}

impl AdmissionError {
    /// Stable machine-readable reason for logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Decode { .. } | AdmissionError::MissingObject(_) => "DecodeFailed",
            AdmissionError::Violation(_) => "PolicyViolation",
            AdmissionError::RootUserConflict => "SecurityContextConflict",
        }
    }
}

/// Outcome of an evaluator: patches to apply (possibly none) or a rejection
pub type AdmissionResult = Result<Vec<PatchOperation>, AdmissionError>;

/// Name/namespace used in rejection messages
#[derive(Debug, Clone, Copy)]
pub(crate) struct Subject<'a> {
    pub kind: ResourceKind,
    pub name: &'a str,
    pub namespace: &'a str,
}

impl<'a> Subject<'a> {
    /// Prefer the decoded object's metadata, falling back to the request
    pub fn new(
        kind: ResourceKind,
        metadata: &'a k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
        target: &'a ResourceRef,
    ) -> Self {
        Self {
            kind,
            name: metadata.name.as_deref().unwrap_or(target.name.as_str()),
            namespace: metadata
                .namespace
                .as_deref()
                .unwrap_or(target.namespace.as_str()),
        }
    }

    /// Log and build a policy violation
    pub fn reject(&self, detail: impl fmt::Display) -> AdmissionError {
        let message = format!(
            "Rejected {} name: {} namespace: {}. {}",
            self.kind, self.name, self.namespace, detail
        );
        warn!(
            kind = %self.kind,
            name = %self.name,
            namespace = %self.namespace,
            "{}",
            message
        );
        AdmissionError::Violation(message)
    }

    pub fn log_validating(&self) {
        debug!(
            kind = %self.kind,
            name = %self.name,
            namespace = %self.namespace,
            "Validating object"
        );
    }
}

/// Allow a request whose kind tag does not match the evaluator
pub(crate) fn kind_mismatch(kind: ResourceKind, target: &ResourceRef) -> bool {
    if kind.matches(target) {
        return false;
    }
    info!(
        expected = %format!("{}/{}/{}", kind.group(), kind.version(), kind.plural()),
        received = %target.gvr(),
        namespace = %target.namespace,
        name = %target.name,
        "Unexpected resource for {} policy, allowing unchanged",
        kind
    );
    true
}

/// Decode the request object into the typed resource for `kind`
pub(crate) fn decode<K: DeserializeOwned>(
    kind: ResourceKind,
    ctx: &AdmissionContext<'_>,
) -> Result<K, AdmissionError> {
    let object = ctx.object.ok_or_else(|| {
        warn!(
            kind = %kind,
            namespace = %ctx.target.namespace,
            name = %ctx.target.name,
            "Admission request has no object"
        );
        AdmissionError::MissingObject(kind)
    })?;

    trace!(object = ?object, "Raw admission object");

    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|source| {
            warn!(kind = %kind, error = %source, "Failed to decode object");
            AdmissionError::Decode { kind, source }
        })
}

/// Log the patch set returned for an allowed object
pub(crate) fn log_patches(subject: &Subject<'_>, patches: &[PatchOperation]) {
    for patch in patches {
        debug!(
            kind = %subject.kind,
            name = %subject.name,
            namespace = %subject.namespace,
            patch = %patch,
            "Patch operation"
        );
    }
    info!(
        kind = %subject.kind,
        name = %subject.name,
        namespace = %subject.namespace,
        patches = patches.len(),
        "Approved"
    );
}

/// Run the evaluator for `kind`
pub fn admit(kind: ResourceKind, ctx: &AdmissionContext<'_>) -> AdmissionResult {
    match kind {
        ResourceKind::Pod => pod::admit(ctx),
        ResourceKind::Deployment => deployment::admit(ctx),
        ResourceKind::Service => service::admit(ctx),
        ResourceKind::Ingress => ingress::admit(ctx),
        ResourceKind::LegacyIngress => legacy_ingress::admit(ctx),
    }
}
