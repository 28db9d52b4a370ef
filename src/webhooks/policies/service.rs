//! Service policy. Validate only, never patches.

use k8s_openapi::api::core::v1::Service;

use super::{
    AdmissionContext, AdmissionResult, DESCRIPTION_ANNOTATION, ResourceKind, ResourceRef,
    SVC_LABEL, Subject, decode, exemption, kind_mismatch, log_patches,
};

pub fn admit(ctx: &AdmissionContext<'_>) -> AdmissionResult {
    if kind_mismatch(ResourceKind::Service, ctx.target) {
        return Ok(Vec::new());
    }

    if exemption::check(ResourceKind::Service, ctx.target, ctx.config).is_some() {
        return Ok(Vec::new());
    }

    let svc: Service = decode(ResourceKind::Service, ctx)?;
    evaluate(&svc, ctx.target)
}

/// Apply the service rules to a decoded Service
pub fn evaluate(svc: &Service, target: &ResourceRef) -> AdmissionResult {
    let subject = Subject::new(ResourceKind::Service, &svc.metadata, target);
    subject.log_validating();

    let Some(annotations) = svc.metadata.annotations.as_ref() else {
        return Err(subject.reject("metadata.annotations object is missing"));
    };

    let Some(label) = svc.metadata.labels.as_ref().and_then(|l| l.get(SVC_LABEL)) else {
        return Err(subject.reject("metadata.labels.svc is missing"));
    };
    if label != subject.name {
        return Err(subject.reject(format!(
            "metadata.labels.svc: {} must match service name: {}",
            label, subject.name
        )));
    }

    if !annotations.contains_key(DESCRIPTION_ANNOTATION) {
        return Err(subject.reject("metadata.annotations.description is missing"));
    }

    let selector = svc
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .and_then(|s| s.get(SVC_LABEL));
    let Some(selector) = selector else {
        return Err(subject.reject("spec.selector.svc is missing"));
    };
    if selector != subject.name {
        return Err(subject.reject(format!(
            "spec.selector.svc: {} must match service name: {}",
            selector, subject.name
        )));
    }

    log_patches(&subject, &[]);
    Ok(Vec::new())
}
