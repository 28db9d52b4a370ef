//! Pod policy.
//!
//! Applies run-as-non-root defaulting to the pod-level security context.
//! Pods are only exempted by namespace.

use k8s_openapi::api::core::v1::Pod;

use super::security_context::{POD_SECURITY_CONTEXT, RunAs, default_run_as};
use super::{
    AdmissionContext, AdmissionResult, ResourceKind, ResourceRef, Subject, decode, exemption,
    kind_mismatch, log_patches,
};

pub fn admit(ctx: &AdmissionContext<'_>) -> AdmissionResult {
    if kind_mismatch(ResourceKind::Pod, ctx.target) {
        return Ok(Vec::new());
    }

    if exemption::check(ResourceKind::Pod, ctx.target, ctx.config).is_some() {
        return Ok(Vec::new());
    }

    let pod: Pod = decode(ResourceKind::Pod, ctx)?;
    evaluate(&pod, ctx.target)
}

/// Apply the pod rules to a decoded Pod
pub fn evaluate(pod: &Pod, target: &ResourceRef) -> AdmissionResult {
    let subject = Subject::new(ResourceKind::Pod, &pod.metadata, target);
    subject.log_validating();

    // Resource requests are left as declared; only Deployments rewrite them.
    let run_as = RunAs::from_pod_spec(pod.spec.as_ref());
    let patches = default_run_as(&POD_SECURITY_CONTEXT, run_as).inspect_err(|e| {
        tracing::warn!(
            name = %subject.name,
            namespace = %subject.namespace,
            reason = e.reason(),
            "Rejected pod: {}",
            e
        );
    })?;

    log_patches(&subject, &patches);
    Ok(patches)
}
