//! Decides whether policy enforcement applies to a request at all.
//!
//! Both exemption paths are fail-open: an unmonitored namespace or an exempt
//! `namespace/name` identity is allowed unchanged without decoding the object.

use tracing::info;

use super::{ResourceKind, ResourceRef};
use crate::config::PolicyConfig;

/// Why a request skipped enforcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exemption {
    /// Namespace does not start with any monitored prefix
    UnmonitoredNamespace,
    /// `namespace/name` is listed in the kind's exempt set
    ExemptIdentity,
}

impl Exemption {
    pub fn reason(self) -> &'static str {
        match self {
            Exemption::UnmonitoredNamespace => "Namespace is exempt from webhook validation",
            Exemption::ExemptIdentity => "Object is exempt from webhook validation",
        }
    }
}

/// True iff `namespace` starts with a monitored prefix
pub fn namespace_is_monitored(namespace: &str, config: &PolicyConfig) -> bool {
    config
        .monitor_namespaces()
        .iter()
        .any(|prefix| namespace.starts_with(prefix.as_str()))
}

/// True iff `namespace/name` is in the exempt set for `kind`
pub fn is_exempt(kind: ResourceKind, namespace: &str, name: &str, config: &PolicyConfig) -> bool {
    config
        .exempt_identities(kind)
        .contains(&format!("{}/{}", namespace, name))
}

/// Check both exemption paths for the request, logging any exemption
pub fn check(kind: ResourceKind, target: &ResourceRef, config: &PolicyConfig) -> Option<Exemption> {
    let exemption = if !namespace_is_monitored(&target.namespace, config) {
        Exemption::UnmonitoredNamespace
    } else if is_exempt(kind, &target.namespace, &target.name, config) {
        Exemption::ExemptIdentity
    } else {
        return None;
    };

    info!(
        kind = %kind,
        name = %target.name,
        namespace = %target.namespace,
        "Approved {} name: {} namespace: {}. {}",
        kind,
        target.name,
        target.namespace,
        exemption.reason()
    );
    Some(exemption)
}
