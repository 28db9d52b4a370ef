//! Run-as-non-root defaulting shared by the Pod and Deployment policies.
//!
//! | runAsNonRoot | runAsUser | outcome                                  |
//! |--------------|-----------|------------------------------------------|
//! | unset        | unset     | add runAsNonRoot=true, runAsUser=65534   |
//! | unset        | non-zero  | add runAsNonRoot=true                    |
//! | unset        | 0         | add runAsNonRoot=false                   |
//! | true         | 0         | reject                                   |
//! | true / false | other     | unchanged                                |

use k8s_openapi::api::core::v1::PodSpec;

use super::AdmissionError;
use crate::webhooks::patch::PatchOperation;

/// UID of `nobody` on Alpine
pub const NOBODY_UID: i64 = 65534;

/// Path of the pod-level security context on a Pod
pub const POD_SECURITY_CONTEXT: [&str; 2] = ["spec", "securityContext"];

/// Path of the pod-level security context inside a Deployment's template
pub const TEMPLATE_SECURITY_CONTEXT: [&str; 4] = ["spec", "template", "spec", "securityContext"];

/// The two fields the defaulter looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunAs {
    pub run_as_non_root: Option<bool>,
    pub run_as_user: Option<i64>,
}

impl RunAs {
    pub fn from_pod_spec(spec: Option<&PodSpec>) -> Self {
        spec.and_then(|s| s.security_context.as_ref())
            .map(|sc| Self {
                run_as_non_root: sc.run_as_non_root,
                run_as_user: sc.run_as_user,
            })
            .unwrap_or_default()
    }
}

/// Compute the patches defaulting `run_as` under `base`, or reject a
/// non-root claim that contradicts a root UID.
pub fn default_run_as(base: &[&str], run_as: RunAs) -> Result<Vec<PatchOperation>, AdmissionError> {
    let field = |name: &'static str| base.iter().copied().chain(std::iter::once(name));

    match (run_as.run_as_non_root, run_as.run_as_user) {
        (None, None) => Ok(vec![
            PatchOperation::add(field("runAsNonRoot"), true),
            PatchOperation::add(field("runAsUser"), NOBODY_UID),
        ]),
        // Defaulting to true here would contradict an explicit root UID
        (None, Some(uid)) => Ok(vec![PatchOperation::add(field("runAsNonRoot"), uid != 0)]),
        (Some(true), Some(0)) => Err(AdmissionError::RootUserConflict),
        (Some(_), _) => Ok(Vec::new()),
    }
}
