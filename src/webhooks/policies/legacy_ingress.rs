//! Ingresses on the removed `extensions/v1beta1` API.
//!
//! Anything reaching this endpoint under that API in a monitored namespace
//! is rejected. The object body is never decoded; the request's resource
//! tag alone decides.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{AdmissionContext, AdmissionResult, ResourceKind, Subject, exemption, kind_mismatch};

/// API version no longer accepted for ingresses
pub const DEPRECATED_API_VERSION: &str = "extensions/v1beta1";
/// API version ingresses must be written against instead
pub const SUPPORTED_API_VERSION: &str = "networking.k8s.io/v1";

pub fn admit(ctx: &AdmissionContext<'_>) -> AdmissionResult {
    if exemption::check(ResourceKind::LegacyIngress, ctx.target, ctx.config).is_some() {
        return Ok(Vec::new());
    }

    if kind_mismatch(ResourceKind::LegacyIngress, ctx.target) {
        return Ok(Vec::new());
    }

    let unnamed = ObjectMeta::default();
    let metadata = ctx.object.map_or(&unnamed, |object| &object.metadata);
    let subject = Subject::new(ResourceKind::Ingress, metadata, ctx.target);

    Err(subject.reject(format!(
        "apiVersion: {} is deprecated, use {}",
        DEPRECATED_API_VERSION, SUPPORTED_API_VERSION
    )))
}
