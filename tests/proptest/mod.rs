// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for admission-standards.
//!
//! Uses proptest to generate random inputs and verify invariants.

#[path = "../common/mod.rs"]
mod common;

use proptest::prelude::*;

use admission_standards::webhooks::patch::{PatchOperation, PatchValue};
use admission_standards::webhooks::policies::deployment::{
    self, CPU_REQUEST, MEMORY_REQUEST, TZ_DEFAULT, TZ_ENV,
};
use admission_standards::webhooks::policies::ingress::{self, NameCheck, classify_name};
use admission_standards::webhooks::policies::security_context::{
    POD_SECURITY_CONTEXT, RunAs, default_run_as,
};
use admission_standards::webhooks::policies::{self, AdmissionContext};
use admission_standards::webhooks::{AdmissionError, ResourceKind, ResourceRef};

use common::fixtures::{self, DeploymentBuilder, IngressBuilder};

/// Strategy for DNS-label style names.
fn dns_label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,14}[a-z0-9]"
}

/// Strategy for namespaces outside every monitored prefix.
fn unmonitored_namespace() -> impl Strategy<Value = String> {
    dns_label().prop_filter("must not be monitored", |ns| {
        !ns.starts_with("prod") && !ns.starts_with("team-")
    })
}

/// Strategy for image references, including floating tags.
fn image() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z]{3,8}/[a-z]{3,8}:[0-9]\\.[0-9]{1,2}\\.[0-9]{1,2}",
        Just("registry/app:latest".to_string()),
        Just("registry/app:STABLE".to_string()),
    ]
}

/// Strategy for the two security-context fields.
fn run_as() -> impl Strategy<Value = RunAs> {
    (
        proptest::option::of(any::<bool>()),
        proptest::option::of(prop_oneof![Just(0i64), 1i64..100_000]),
    )
        .prop_map(|(run_as_non_root, run_as_user)| RunAs {
            run_as_non_root,
            run_as_user,
        })
}

/// Apply security-context patches onto the two fields they target.
fn apply(mut run_as: RunAs, patches: &[PatchOperation]) -> RunAs {
    for patch in patches {
        match &patch.value {
            PatchValue::Boolean(b) if patch.path().ends_with("/runAsNonRoot") => {
                run_as.run_as_non_root = Some(*b);
            }
            PatchValue::Integer(i) if patch.path().ends_with("/runAsUser") => {
                run_as.run_as_user = Some(*i);
            }
            other => panic!("unexpected patch {} = {}", patch.path(), other),
        }
    }
    run_as
}

proptest! {
    /// Defaulting is idempotent: re-running on the patched values yields nothing.
    #[test]
    fn security_context_defaulting_is_idempotent(original in run_as()) {
        if let Ok(patches) = default_run_as(&POD_SECURITY_CONTEXT, original) {
            let patched = apply(original, &patches);
            let again = default_run_as(&POD_SECURITY_CONTEXT, patched).unwrap();
            prop_assert!(again.is_empty());
        }
    }

    /// runAsNonRoot=true with runAsUser=0 is the only rejecting combination.
    #[test]
    fn only_root_conflict_rejects(original in run_as()) {
        let result = default_run_as(&POD_SECURITY_CONTEXT, original);
        let conflict = original.run_as_non_root == Some(true) && original.run_as_user == Some(0);
        prop_assert_eq!(conflict, matches!(result, Err(AdmissionError::RootUserConflict)));
    }

    /// Unset runAsNonRoot with root UID yields exactly runAsNonRoot=false.
    #[test]
    fn root_uid_defaults_to_false(_seed in any::<u8>()) {
        let patches = default_run_as(
            &POD_SECURITY_CONTEXT,
            RunAs { run_as_non_root: None, run_as_user: Some(0) },
        )
        .unwrap();
        prop_assert_eq!(patches.len(), 1);
        prop_assert_eq!(&patches[0].value, &PatchValue::Boolean(false));
    }

    /// Unmonitored namespaces are allowed unchanged regardless of content.
    #[test]
    fn unmonitored_namespace_always_allowed(
        namespace in unmonitored_namespace(),
        name in dns_label(),
        svc in proptest::option::of(dns_label()),
        image in image(),
    ) {
        let deploy = DeploymentBuilder::new(name.clone())
            .namespace(namespace.clone())
            .svc_label(svc.as_deref())
            .without_description()
            .container("app", &image)
            .build();
        let object = fixtures::to_dynamic(&deploy);
        let target = ResourceRef::new(ResourceKind::Deployment, namespace, name);
        let config = fixtures::test_config();

        for kind in ResourceKind::ALL {
            let mut target = target.clone();
            target.group = kind.group().to_string();
            target.version = kind.version().to_string();
            target.resource = kind.plural().to_string();
            let ctx = AdmissionContext { target: &target, object: Some(&object), config: &config };
            prop_assert!(policies::admit(kind, &ctx).unwrap().is_empty());
        }
    }

    /// Every container ends up with the fixed requests and a TZ entry.
    #[test]
    fn deployment_containers_are_normalized(
        containers in proptest::collection::vec(
            (dns_label(), proptest::option::of("[A-Z][a-z]{2,8}/[A-Z][a-z]{2,8}")),
            1..5,
        ),
    ) {
        let mut builder = DeploymentBuilder::new("billing");
        for (name, tz) in &containers {
            builder = match tz {
                Some(tz) => builder.container_with_env(name, "registry/billing:1.0.0", &[(TZ_ENV, tz.as_str())]),
                None => builder.container(name, "registry/billing:1.0.0"),
            };
        }
        let deploy = builder.build();
        let target = ResourceRef::new(ResourceKind::Deployment, "prod", "billing");

        let patches = deployment::evaluate(&deploy, &target).unwrap();
        let PatchValue::Containers(rewritten) = &patches[0].value else {
            panic!("first patch should replace containers");
        };
        prop_assert_eq!(rewritten.len(), containers.len());

        for (container, (_, tz)) in rewritten.iter().zip(&containers) {
            let requests = container.resources.as_ref().unwrap().requests.as_ref().unwrap();
            prop_assert_eq!(&requests["cpu"].0, CPU_REQUEST);
            prop_assert_eq!(&requests["memory"].0, MEMORY_REQUEST);

            let env = container.env.as_ref().unwrap();
            let tz_entries: Vec<_> = env.iter().filter(|e| e.name == TZ_ENV).collect();
            prop_assert_eq!(tz_entries.len(), 1);
            let expected = tz.as_deref().unwrap_or(TZ_DEFAULT);
            prop_assert_eq!(tz_entries[0].value.as_deref(), Some(expected));
        }
    }

    /// Floating tags reject regardless of case or position.
    #[test]
    fn floating_tags_reject(prefix in "[a-z]{1,6}", tag in "[lL][aA][tT][eE][sS][tT]|[sS][tT][aA][bB][lL][eE]") {
        let deploy = DeploymentBuilder::new("billing")
            .container("app", &format!("registry/{}:{}", prefix, tag))
            .build();
        let target = ResourceRef::new(ResourceKind::Deployment, "prod", "billing");
        let err = deployment::evaluate(&deploy, &target).unwrap_err();
        prop_assert!(err.to_string().contains("must not contain latest or stable"));
    }

    /// A minion routing `/ns/svc/` passes; any other path rejects.
    #[test]
    fn minion_path_must_be_namespace_and_service(
        namespace in "prod[a-z0-9-]{0,8}",
        service in dns_label(),
        path in proptest::option::of("/[a-z0-9/-]{0,20}"),
    ) {
        let config = fixtures::test_config();
        let expected = format!("/{}/{}/", namespace, service);
        let path = path.unwrap_or_else(|| expected.clone());

        let mut ingress = IngressBuilder::minion(service.clone(), service.clone())
            .label("svc", service.clone())
            .build();
        ingress.metadata.namespace = Some(namespace.clone());
        ingress.spec.as_mut().unwrap().rules.as_mut().unwrap()[0]
            .http
            .as_mut()
            .unwrap()
            .paths[0]
            .path = Some(path.clone());

        let target = ResourceRef::new(ResourceKind::Ingress, namespace, service);
        let result = ingress::evaluate(&ingress, &target, &config);
        if path == expected {
            prop_assert!(result.unwrap().is_empty());
        } else {
            let err = result.unwrap_err().to_string();
            prop_assert!(err.contains("spec.rules.http.paths.path"), "{}", err);
        }
    }

    /// The -inetsvcs alias is only accepted on an inetsvcs host.
    #[test]
    fn inetsvcs_alias_requires_host(
        service in dns_label(),
        host in prop_oneof![
            Just("shop.example.com".to_string()),
            Just("shop.inetsvcs.example.com".to_string()),
        ],
    ) {
        let alias = format!("{}-inetsvcs", service);
        let check = classify_name(&alias, &service, &host);
        if host.contains("inetsvcs") {
            prop_assert_eq!(check, NameCheck::InetsvcsAlias);
        } else {
            prop_assert_eq!(check, NameCheck::InetsvcsHostMismatch);
        }
        prop_assert_eq!(classify_name(&service, &service, &host), NameCheck::MatchesService);
    }
}
